//! DHCPv4 message handling over the lease engine.
//!
//! The wire codec is `dhcproto`; this service receives decoded messages
//! and decides. DISCOVER walks the allocator, REQUEST confirms or NAKs,
//! RELEASE and DECLINE tear down, INFORM answers with options only.
//! Option 61 (client-id) takes precedence over chaddr for identity;
//! option 82 sub-options 1 and 2 land in the lease's relay info.
use std::net::Ipv4Addr;
use std::sync::Arc;

use dhcproto::v4::{
    relay::{RelayCode, RelayInfo as RelayOpt},
    DhcpOption, Message, MessageType, Opcode, OptionCode,
};
use tracing::{debug, instrument, warn};

use conflict_detect::ArpAnnouncer;
use dynconfig::ConfigStore;
use haven_core::prelude::*;

use crate::engine::{ClientView, LeaseEngine};

/// Where a request came in: the receiving interface's address and
/// subnet, used when no relay is involved.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta {
    /// IP of the interface the message arrived on
    pub iface_ip: Ipv4Addr,
}

/// The DHCPv4 service. Stateless per request; every mutation passes the
/// write gate first, so a standby node stays silent on the wire.
pub struct DhcpService {
    engine: Arc<LeaseEngine>,
    cfg: ConfigStore,
    gate: Arc<dyn WriteGate>,
    announcer: Arc<dyn ArpAnnouncer>,
    server_id: Ipv4Addr,
}

impl std::fmt::Debug for DhcpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpService")
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl DhcpService {
    pub fn new(
        engine: Arc<LeaseEngine>,
        cfg: ConfigStore,
        gate: Arc<dyn WriteGate>,
        announcer: Arc<dyn ArpAnnouncer>,
        server_id: Ipv4Addr,
    ) -> Self {
        Self {
            engine,
            cfg,
            gate,
            announcer,
            server_id,
        }
    }

    /// Handle one decoded message. `None` means no response goes on the
    /// wire (standby node, unknown subnet, or nothing to say).
    #[instrument(level = "debug", skip_all, fields(xid = req.xid()))]
    pub async fn handle(&self, req: &Message, meta: RequestMeta) -> Result<Option<Message>> {
        let Some(msg_type) = req.opts().msg_type() else {
            debug!("message without a message type, ignoring");
            return Ok(None);
        };
        if !self.gate.is_writable() {
            debug!(?msg_type, "standby node, staying silent on the wire");
            return Ok(None);
        }

        let client = client_view(req);
        let subnet_hint = if req.giaddr().is_unspecified() {
            meta.iface_ip
        } else {
            req.giaddr()
        };

        match msg_type {
            MessageType::Discover => self.discover(req, &client, subnet_hint).await,
            MessageType::Request => self.request(req, &client).await,
            MessageType::Release => {
                let ip = requested_ip(req).unwrap_or_else(|| req.ciaddr());
                if !ip.is_unspecified() {
                    self.engine.release(ip, client.mac).await?;
                }
                Ok(None)
            }
            MessageType::Decline => {
                if let Some(ip) = requested_ip(req) {
                    self.engine.decline(ip, client.mac).await?;
                }
                Ok(None)
            }
            MessageType::Inform => self.inform(req, &client),
            other => {
                debug!(?other, "unhandled message type");
                Ok(None)
            }
        }
    }

    async fn discover(
        &self,
        req: &Message,
        client: &ClientView,
        subnet_hint: Ipv4Addr,
    ) -> Result<Option<Message>> {
        let lease = match self.engine.create_offer(client, subnet_hint).await {
            Ok(lease) => lease,
            Err(Error::NoAddressAvailable) => {
                warn!(mac = %client.mac, "no address available, staying silent");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let mut resp = reply_skeleton(req, self.server_id);
        resp.set_yiaddr(lease.ip);
        resp.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Offer));
        self.push_lease_opts(&mut resp, &lease);
        Ok(Some(resp))
    }

    async fn request(&self, req: &Message, client: &ClientView) -> Result<Option<Message>> {
        // requested address comes from option 50 or, on renew, ciaddr
        let ip = match requested_ip(req).or_else(|| {
            (!req.ciaddr().is_unspecified()).then(|| req.ciaddr())
        }) {
            Some(ip) => ip,
            None if self.cfg.defaults().authoritative => {
                return Ok(Some(nak(req, self.server_id, "no requested address")));
            }
            None => return Ok(None),
        };

        match self.engine.confirm_lease(client, ip).await {
            Ok((lease, _renewal)) => {
                if self.cfg.defaults().gratuitous_arp {
                    self.announcer.announce(lease.ip, lease.mac);
                }
                let mut resp = reply_skeleton(req, self.server_id);
                resp.set_yiaddr(lease.ip);
                resp.opts_mut()
                    .insert(DhcpOption::MessageType(MessageType::Ack));
                self.push_lease_opts(&mut resp, &lease);
                Ok(Some(resp))
            }
            Err(err) if self.cfg.defaults().authoritative => {
                debug!(%err, %ip, "cannot confirm, NAKing");
                Ok(Some(nak(req, self.server_id, "address not available")))
            }
            Err(err) => {
                debug!(%err, %ip, "cannot confirm and not authoritative, silent");
                Ok(None)
            }
        }
    }

    fn inform(&self, req: &Message, client: &ClientView) -> Result<Option<Message>> {
        // options only, no address assignment (RFC 2131 §4.3.5)
        let subnet = self.cfg.subnet_for(req.ciaddr());
        let mut resp = reply_skeleton(req, self.server_id);
        resp.opts_mut()
            .insert(DhcpOption::MessageType(MessageType::Ack));
        if let Some(subnet) = subnet {
            resp.opts_mut()
                .insert(DhcpOption::SubnetMask(subnet.cidr.netmask()));
        }
        debug!(mac = %client.mac, "answered inform");
        Ok(Some(resp))
    }

    fn push_lease_opts(&self, resp: &mut Message, lease: &Lease) {
        let (secs, t1, t2) = self.lease_times(lease);
        resp.opts_mut()
            .insert(DhcpOption::AddressLeaseTime(secs));
        resp.opts_mut().insert(DhcpOption::Renewal(t1));
        resp.opts_mut().insert(DhcpOption::Rebinding(t2));
        resp.opts_mut()
            .insert(DhcpOption::SubnetMask(lease.subnet.netmask()));
        if let Some(host) = &lease.hostname {
            resp.opts_mut().insert(DhcpOption::Hostname(host.clone()));
        }
    }

    /// Lease/T1/T2 for the response. T1 at half the lease, T2 at 7/8,
    /// per RFC 2131 defaults.
    fn lease_times(&self, lease: &Lease) -> (u32, u32, u32) {
        let subnet = self.cfg.subnet_for(lease.ip);
        let secs = match &subnet {
            Some(subnet) => {
                let pool = subnet.pools.iter().find(|p| p.contains(lease.ip));
                let reservation = subnet
                    .reservations
                    .iter()
                    .find(|r| r.ip == lease.ip)
                    .cloned();
                self.engine.lease_secs(subnet, pool, reservation.as_ref())
            }
            None => self.cfg.defaults().lease_time_secs,
        } as u32;
        (secs, secs / 2, secs / 8 * 7)
    }
}

/// Identity and attributes pulled off the wire message.
fn client_view(req: &Message) -> ClientView {
    let mac = mac_from_chaddr(req.chaddr());
    let client_id = match req.opts().get(OptionCode::ClientIdentifier) {
        Some(DhcpOption::ClientIdentifier(id)) if !id.is_empty() => Some(id.clone()),
        _ => None,
    };
    let hostname = match req.opts().get(OptionCode::Hostname) {
        Some(DhcpOption::Hostname(name)) => Some(name.clone()),
        _ => None,
    };
    let vendor_class = match req.opts().get(OptionCode::ClassIdentifier) {
        Some(DhcpOption::ClassIdentifier(v)) => Some(String::from_utf8_lossy(v).into_owned()),
        _ => None,
    };
    let user_class = match req.opts().get(OptionCode::UserClass) {
        Some(DhcpOption::UserClass(v)) => Some(String::from_utf8_lossy(v).into_owned()),
        _ => None,
    };

    let mut relay = RelayInfo::default();
    if !req.giaddr().is_unspecified() {
        relay.giaddr = Some(req.giaddr());
    }
    if let Some(DhcpOption::RelayAgentInformation(info)) =
        req.opts().get(OptionCode::RelayAgentInformation)
    {
        if let Some(RelayOpt::AgentCircuitId(id)) = info.get(RelayCode::AgentCircuitId) {
            relay.circuit_id = Some(id.clone());
        }
        if let Some(RelayOpt::AgentRemoteId(id)) = info.get(RelayCode::AgentRemoteId) {
            relay.remote_id = Some(id.clone());
        }
    }

    ClientView {
        mac,
        client_id,
        hostname,
        requested_ip: requested_ip(req),
        vendor_class,
        user_class,
        relay,
    }
}

fn requested_ip(req: &Message) -> Option<Ipv4Addr> {
    match req.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => None,
    }
}

fn mac_from_chaddr(chaddr: &[u8]) -> MacAddr {
    if chaddr.len() >= 6 {
        MacAddr::new(chaddr[0], chaddr[1], chaddr[2], chaddr[3], chaddr[4], chaddr[5])
    } else {
        MacAddr::zero()
    }
}

/// A reply carrying the request's transaction identity, per the shape
/// of RFC 2131 §4.3.1.
fn reply_skeleton(req: &Message, server_id: Ipv4Addr) -> Message {
    let mut msg = Message::new_with_id(
        req.xid(),
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::UNSPECIFIED,
        server_id,
        req.giaddr(),
        req.chaddr(),
    );
    msg.set_opcode(Opcode::BootReply)
        .set_htype(req.htype())
        .set_flags(req.flags())
        .set_hops(req.hops());
    msg.opts_mut()
        .insert(DhcpOption::ServerIdentifier(server_id));
    if let Some(id) = req.opts().get(OptionCode::ClientIdentifier) {
        msg.opts_mut().insert(id.clone());
    }
    if let Some(info) = req.opts().get(OptionCode::RelayAgentInformation) {
        msg.opts_mut().insert(info.clone());
    }
    msg
}

fn nak(req: &Message, server_id: Ipv4Addr, reason: &str) -> Message {
    let mut resp = reply_skeleton(req, server_id);
    resp.opts_mut()
        .insert(DhcpOption::MessageType(MessageType::Nak));
    resp.opts_mut()
        .insert(DhcpOption::Message(reason.to_string()));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{client as engine_client, fixture, gated_pools_subnet, test_subnet};
    use dhcproto::v4::relay::RelayAgentInformation;
    use dynconfig::Section;
    use haven_core::gate::{AlwaysWritable, NeverWritable};
    use conflict_detect::NullAnnouncer;
    use tracing_test::traced_test;

    const SERVER_ID: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    fn service(fx: &crate::engine::tests::Fixture, gate: Arc<dyn WriteGate>) -> DhcpService {
        DhcpService::new(
            Arc::clone(&fx.engine),
            fx.cfg.clone(),
            gate,
            Arc::new(NullAnnouncer),
            SERVER_ID,
        )
    }

    fn meta() -> RequestMeta {
        RequestMeta {
            iface_ip: Ipv4Addr::new(192, 168, 1, 1),
        }
    }

    fn wire_msg(mac: &str, msg_type: MessageType) -> Message {
        let mac: MacAddr = mac.parse().unwrap();
        let chaddr = [mac.0, mac.1, mac.2, mac.3, mac.4, mac.5];
        let mut msg = Message::new_with_id(
            0x1234,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &chaddr,
        );
        msg.opts_mut().insert(DhcpOption::MessageType(msg_type));
        msg
    }

    fn yiaddr(resp: &Message) -> Ipv4Addr {
        resp.yiaddr()
    }

    fn msg_type(resp: &Message) -> MessageType {
        resp.opts().msg_type().unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn basic_lease_scenario() {
        let fx = fixture();
        let svc = service(&fx, Arc::new(AlwaysWritable));
        let mac = "00:11:22:33:44:55";

        let offer = svc
            .handle(&wire_msg(mac, MessageType::Discover), meta())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg_type(&offer), MessageType::Offer);
        assert_eq!(yiaddr(&offer), Ipv4Addr::new(192, 168, 1, 100));

        let mut request = wire_msg(mac, MessageType::Request);
        request
            .opts_mut()
            .insert(DhcpOption::RequestedIpAddress(yiaddr(&offer)));
        let ack = svc.handle(&request, meta()).await.unwrap().unwrap();
        assert_eq!(msg_type(&ack), MessageType::Ack);
        assert_eq!(yiaddr(&ack), Ipv4Addr::new(192, 168, 1, 100));
        // 12 hour lease advertised
        assert!(matches!(
            ack.opts().get(OptionCode::AddressLeaseTime),
            Some(DhcpOption::AddressLeaseTime(43_200))
        ));

        let lease = fx.engine.get_by_ip(yiaddr(&ack)).unwrap();
        assert_eq!(lease.state, LeaseState::Active);
    }

    #[tokio::test]
    #[traced_test]
    async fn reservation_scenario() {
        let fx = fixture();
        let svc = service(&fx, Arc::new(AlwaysWritable));
        let offer = svc
            .handle(&wire_msg("aa:bb:cc:dd:ee:ff", MessageType::Discover), meta())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(yiaddr(&offer), Ipv4Addr::new(192, 168, 1, 10));
        assert!(matches!(
            offer.opts().get(OptionCode::Hostname),
            Some(DhcpOption::Hostname(h)) if h == "switch-core"
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn decline_reoffers_next() {
        let fx = fixture();
        let svc = service(&fx, Arc::new(AlwaysWritable));
        let mac = "00:11:22:33:44:55";

        let offer = svc
            .handle(&wire_msg(mac, MessageType::Discover), meta())
            .await
            .unwrap()
            .unwrap();
        let mut request = wire_msg(mac, MessageType::Request);
        request
            .opts_mut()
            .insert(DhcpOption::RequestedIpAddress(yiaddr(&offer)));
        svc.handle(&request, meta()).await.unwrap().unwrap();

        let mut decline = wire_msg(mac, MessageType::Decline);
        decline
            .opts_mut()
            .insert(DhcpOption::RequestedIpAddress(yiaddr(&offer)));
        assert!(svc.handle(&decline, meta()).await.unwrap().is_none());

        let second = svc
            .handle(&wire_msg(mac, MessageType::Discover), meta())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(yiaddr(&second), Ipv4Addr::new(192, 168, 1, 101));
    }

    #[tokio::test]
    #[traced_test]
    async fn request_for_foreign_lease_naks() {
        let fx = fixture();
        let svc = service(&fx, Arc::new(AlwaysWritable));

        let c = engine_client("00:11:22:33:44:55");
        let offer = fx.engine.create_offer(&c, Ipv4Addr::new(192, 168, 1, 0)).await.unwrap();
        fx.engine.confirm_lease(&c, offer.ip).await.unwrap();

        let mut request = wire_msg("de:ad:be:ef:00:01", MessageType::Request);
        request
            .opts_mut()
            .insert(DhcpOption::RequestedIpAddress(offer.ip));
        let resp = svc.handle(&request, meta()).await.unwrap().unwrap();
        assert_eq!(msg_type(&resp), MessageType::Nak);
    }

    #[tokio::test]
    #[traced_test]
    async fn standby_node_is_silent() {
        let fx = fixture();
        let svc = service(
            &fx,
            Arc::new(NeverWritable {
                redirect: "https://primary".into(),
            }),
        );
        let resp = svc
            .handle(&wire_msg("00:11:22:33:44:55", MessageType::Discover), meta())
            .await
            .unwrap();
        assert!(resp.is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn client_id_takes_precedence_over_chaddr() {
        let fx = fixture();
        let svc = service(&fx, Arc::new(AlwaysWritable));

        let mut discover = wire_msg("00:11:22:33:44:55", MessageType::Discover);
        discover
            .opts_mut()
            .insert(DhcpOption::ClientIdentifier(vec![1, 2, 3, 4]));
        let offer = svc.handle(&discover, meta()).await.unwrap().unwrap();

        let lease = fx.engine.get_by_ip(yiaddr(&offer)).unwrap();
        assert_eq!(lease.client_id.as_deref(), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(
            fx.engine.store().get_by_client_id(&[1, 2, 3, 4]).unwrap().ip,
            lease.ip
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn inform_answers_options_only() {
        let fx = fixture();
        let svc = service(&fx, Arc::new(AlwaysWritable));
        let mut inform = wire_msg("00:11:22:33:44:55", MessageType::Inform);
        inform.set_ciaddr(Ipv4Addr::new(192, 168, 1, 77));
        let resp = svc.handle(&inform, meta()).await.unwrap().unwrap();
        assert_eq!(msg_type(&resp), MessageType::Ack);
        assert!(yiaddr(&resp).is_unspecified());
        assert!(resp.opts().get(OptionCode::AddressLeaseTime).is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn wire_attributes_steer_pool_selection() {
        let fx = fixture();
        fx.cfg
            .replace_section(Section::Subnets, &vec![gated_pools_subnet()])
            .unwrap();
        let svc = service(&fx, Arc::new(AlwaysWritable));

        // option 82 circuit-id steers into the switch pool
        let mut discover = wire_msg("00:11:22:33:44:55", MessageType::Discover);
        let mut info = RelayAgentInformation::default();
        info.insert(RelayOpt::AgentCircuitId(b"eth1/7".to_vec()));
        discover
            .opts_mut()
            .insert(DhcpOption::RelayAgentInformation(info));
        let offer = svc.handle(&discover, meta()).await.unwrap().unwrap();
        assert_eq!(yiaddr(&offer), Ipv4Addr::new(192, 168, 1, 50));

        // option 77 user class steers into the phone pool
        let mut discover = wire_msg("00:11:22:33:44:56", MessageType::Discover);
        discover
            .opts_mut()
            .insert(DhcpOption::UserClass(b"voip-handset".to_vec()));
        let offer = svc.handle(&discover, meta()).await.unwrap().unwrap();
        assert_eq!(yiaddr(&offer), Ipv4Addr::new(192, 168, 1, 60));

        // neither attribute: the open pool
        let offer = svc
            .handle(&wire_msg("00:11:22:33:44:57", MessageType::Discover), meta())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(yiaddr(&offer), Ipv4Addr::new(192, 168, 1, 100));

        // the steering circuit-id is recorded on the lease
        let lease = fx.engine.get_by_ip(Ipv4Addr::new(192, 168, 1, 50)).unwrap();
        assert_eq!(lease.relay.circuit_id.as_deref(), Some(&b"eth1/7"[..]));
    }

    #[tokio::test]
    #[traced_test]
    async fn relay_info_lands_in_lease() {
        let fx = fixture();
        // second subnet reachable only via relay
        let mut relay_subnet = test_subnet();
        relay_subnet.cidr = "10.9.0.0/24".parse().unwrap();
        relay_subnet.pools[0].start = Ipv4Addr::new(10, 9, 0, 50);
        relay_subnet.pools[0].end = Ipv4Addr::new(10, 9, 0, 99);
        relay_subnet.reservations.clear();
        fx.cfg
            .replace_section(Section::Subnets, &vec![test_subnet(), relay_subnet])
            .unwrap();

        let svc = service(&fx, Arc::new(AlwaysWritable));
        let mut discover = wire_msg("00:11:22:33:44:55", MessageType::Discover);
        discover.set_giaddr(Ipv4Addr::new(10, 9, 0, 1));
        let offer = svc.handle(&discover, meta()).await.unwrap().unwrap();
        assert_eq!(yiaddr(&offer), Ipv4Addr::new(10, 9, 0, 50));

        let lease = fx.engine.get_by_ip(yiaddr(&offer)).unwrap();
        assert_eq!(lease.relay.giaddr, Some(Ipv4Addr::new(10, 9, 0, 1)));
        assert_eq!(lease.subnet, "10.9.0.0/24".parse::<Ipv4Net>().unwrap());
    }
}
