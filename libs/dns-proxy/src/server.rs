//! The resolver pipeline and the UDP/TCP listeners.
//!
//! Per query: local zone first, then the blocklists, then the response
//! cache, then the upstream forwarder. Handlers are stateless and run
//! one task per request.
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dynconfig::BlockAction;
use haven_core::prelude::*;

use crate::blocklist::Blocklists;
use crate::cache::ResponseCache;
use crate::forwarder::Forwarder;
use crate::query_log::{QueryDisposition, QueryLog, QueryLogEntry};
use crate::records::{DnsRecord, RData, RecordType};
use crate::wire;
use crate::zone::Zone;

const UDP_MAX_RESPONSE: usize = 512;

/// The assembled DNS proxy.
pub struct DnsServer {
    pub zone: Arc<Zone>,
    pub cache: Arc<ResponseCache>,
    pub forwarder: Arc<Forwarder>,
    pub blocklists: Arc<Blocklists>,
    pub log: Arc<QueryLog>,
}

impl std::fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsServer")
            .field("zone", &self.zone)
            .finish()
    }
}

impl DnsServer {
    /// Answer one raw query. `None` means the packet was unparseable
    /// and should be dropped.
    pub async fn handle_query(&self, packet: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let started = Instant::now();
        let query = match wire::parse_query(packet) {
            Ok(q) => q,
            Err(err) => {
                debug!(?err, %client, "dropping unparseable query");
                return None;
            }
        };
        let question = query.first()?.clone();

        let (response, disposition) = self.resolve(packet, &query, &question).await;
        self.log.add(QueryLogEntry {
            at: Utc::now(),
            name: question.name.clone(),
            qtype: question.qtype.to_string(),
            client: client.ip().to_string(),
            disposition,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Some(response)
    }

    async fn resolve(
        &self,
        packet: &[u8],
        query: &wire::Query,
        question: &wire::Question,
    ) -> (Vec<u8>, QueryDisposition) {
        // 1. our own zone
        let local = self.zone.lookup(&question.name, question.qtype);
        if !local.is_empty() {
            metrics::DNS_QUERIES.with_label_values(&["local"]).inc();
            return (
                wire::build_response(query, &local, wire::RCODE_NOERROR),
                QueryDisposition::Local,
            );
        }
        if self.zone.is_authoritative(&question.name) {
            metrics::DNS_QUERIES.with_label_values(&["local"]).inc();
            return (
                wire::build_response(query, &[], wire::RCODE_NXDOMAIN),
                QueryDisposition::Local,
            );
        }

        // 2. blocklists
        if let Some(action) = self.blocklists.check(&question.name) {
            metrics::DNS_BLOCKED.inc();
            metrics::DNS_QUERIES.with_label_values(&["blocked"]).inc();
            let response = match action {
                BlockAction::Nxdomain => {
                    wire::build_response(query, &[], wire::RCODE_NXDOMAIN)
                }
                BlockAction::Refuse => wire::build_response(query, &[], wire::RCODE_REFUSED),
                BlockAction::Zero => {
                    let answers = zero_answer(&question.name, question.qtype);
                    wire::build_response(query, &answers, wire::RCODE_NOERROR)
                }
            };
            return (response, QueryDisposition::Blocked);
        }

        // 3. response cache
        if let Some(hit) = self.cache.get(&question.name, question.qtype) {
            metrics::DNS_QUERIES.with_label_values(&["cached"]).inc();
            return (
                wire::build_response(query, &hit.records, hit.rcode),
                QueryDisposition::Cached,
            );
        }

        // 4. upstream
        match self.forwarder.forward(packet).await {
            Ok(response) => {
                metrics::DNS_QUERIES.with_label_values(&["forwarded"]).inc();
                if let Ok((header, answers)) = wire::parse_answers(&response) {
                    self.cache
                        .insert(&question.name, question.qtype, &answers, header.rcode());
                }
                (response, QueryDisposition::Forwarded)
            }
            Err(err) => {
                warn!(name = %question.name, %err, "forwarding failed");
                metrics::DNS_QUERIES.with_label_values(&["failed"]).inc();
                (
                    wire::build_response(query, &[], wire::RCODE_SERVFAIL),
                    QueryDisposition::Failed,
                )
            }
        }
    }
}

/// The answer for a `zero` block action: 0.0.0.0 / :: for address
/// queries, an empty NOERROR for anything else.
fn zero_answer(name: &str, qtype: RecordType) -> Vec<DnsRecord> {
    match qtype {
        RecordType::A => vec![DnsRecord {
            name: name.to_string(),
            rtype: RecordType::A,
            ttl: 60,
            rdata: RData::A(Ipv4Addr::UNSPECIFIED),
        }],
        RecordType::Aaaa => vec![DnsRecord {
            name: name.to_string(),
            rtype: RecordType::Aaaa,
            ttl: 60,
            rdata: RData::Aaaa(Ipv6Addr::UNSPECIFIED),
        }],
        _ => Vec::new(),
    }
}

/// The UDP listener: one task per datagram, responses clamped to 512
/// bytes with TC.
pub async fn run_udp(server: Arc<DnsServer>, socket: UdpSocket, cancel: CancellationToken) {
    let socket = Arc::new(socket);
    info!(addr = ?socket.local_addr().ok(), "dns udp listener up");
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (len, client) = match recv {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?err, "udp receive failed");
                        continue;
                    }
                };
                let packet = buf[..len].to_vec();
                let server = Arc::clone(&server);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Some(mut response) = server.handle_query(&packet, client).await {
                        wire::truncate_for_udp(&mut response, UDP_MAX_RESPONSE);
                        if let Err(err) = socket.send_to(&response, client).await {
                            debug!(?err, %client, "udp send failed");
                        }
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
    info!("dns udp listener stopped");
}

/// The TCP listener: length-prefixed queries, multiple per connection.
pub async fn run_tcp(server: Arc<DnsServer>, listener: TcpListener, cancel: CancellationToken) {
    info!(addr = ?listener.local_addr().ok(), "dns tcp listener up");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, client) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(?err, "tcp accept failed");
                        continue;
                    }
                };
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    loop {
                        let mut len_buf = [0u8; 2];
                        if stream.read_exact(&mut len_buf).await.is_err() {
                            break;
                        }
                        let len = u16::from_be_bytes(len_buf) as usize;
                        let mut packet = vec![0u8; len];
                        if stream.read_exact(&mut packet).await.is_err() {
                            break;
                        }
                        let Some(response) = server.handle_query(&packet, client).await else {
                            break;
                        };
                        let len = (response.len() as u16).to_be_bytes();
                        if stream.write_all(&len).await.is_err()
                            || stream.write_all(&response).await.is_err()
                        {
                            break;
                        }
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
    info!("dns tcp listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynconfig::{BlocklistSource, ListFormat};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn server() -> Arc<DnsServer> {
        let zone = Arc::new(Zone::new("lan", 300, true));
        zone.register_lease("printer", Ipv4Addr::new(192, 168, 1, 100));

        let blocklists = Blocklists::new(vec![]);
        blocklists.load_entries(
            &BlocklistSource {
                name: "ads".into(),
                url: "http://lists.example/ads".into(),
                format: ListFormat::Domains,
                allow: false,
                action: BlockAction::Zero,
                refresh_secs: 86_400,
            },
            vec!["ads.example.com".into()],
        );

        Arc::new(DnsServer {
            zone,
            cache: Arc::new(ResponseCache::new(128, Duration::from_secs(30))),
            // no upstreams: every forward fails fast
            forwarder: Arc::new(Forwarder::new(&[], Duration::from_millis(50))),
            blocklists: Arc::new(blocklists),
            log: Arc::new(QueryLog::new(64)),
        })
    }

    fn client() -> SocketAddr {
        "192.168.1.2:5353".parse().unwrap()
    }

    async fn ask(server: &DnsServer, name: &str, qtype: RecordType) -> (u8, Vec<DnsRecord>) {
        let query = wire::build_query(0x42, name, qtype);
        let response = server.handle_query(&query, client()).await.unwrap();
        let (header, answers) = wire::parse_answers(&response).unwrap();
        (header.rcode(), answers)
    }

    #[tokio::test]
    #[traced_test]
    async fn local_zone_answers_a_and_ptr() {
        let server = server();
        let (rcode, answers) = ask(&server, "printer.lan", RecordType::A).await;
        assert_eq!(rcode, wire::RCODE_NOERROR);
        assert_eq!(answers[0].rdata, RData::A(Ipv4Addr::new(192, 168, 1, 100)));

        let (rcode, answers) = ask(&server, "100.1.168.192.in-addr.arpa", RecordType::Ptr).await;
        assert_eq!(rcode, wire::RCODE_NOERROR);
        assert_eq!(answers[0].rdata, RData::Ptr("printer.lan".into()));
    }

    #[tokio::test]
    #[traced_test]
    async fn authoritative_miss_is_nxdomain() {
        let server = server();
        let (rcode, answers) = ask(&server, "ghost.lan", RecordType::A).await;
        assert_eq!(rcode, wire::RCODE_NXDOMAIN);
        assert!(answers.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn blocked_names_zero_answer() {
        let server = server();
        let (rcode, answers) = ask(&server, "ads.example.com", RecordType::A).await;
        assert_eq!(rcode, wire::RCODE_NOERROR);
        assert_eq!(answers[0].rdata, RData::A(Ipv4Addr::UNSPECIFIED));

        // subdomain is blocked through the parent walk
        let (_, answers) = ask(&server, "deep.ads.example.com", RecordType::Aaaa).await;
        assert_eq!(answers[0].rdata, RData::Aaaa(Ipv6Addr::UNSPECIFIED));
    }

    #[tokio::test]
    #[traced_test]
    async fn cache_answers_before_upstream() {
        let server = server();
        server.cache.insert(
            "cached.example.com",
            RecordType::A,
            &[DnsRecord::a("cached.example.com", Ipv4Addr::new(9, 9, 9, 9), 60)],
            0,
        );
        let (rcode, answers) = ask(&server, "cached.example.com", RecordType::A).await;
        assert_eq!(rcode, wire::RCODE_NOERROR);
        assert_eq!(answers[0].rdata, RData::A(Ipv4Addr::new(9, 9, 9, 9)));
    }

    #[tokio::test]
    #[traced_test]
    async fn upstream_failure_is_servfail() {
        let server = server();
        let (rcode, _) = ask(&server, "unreachable.example.com", RecordType::A).await;
        assert_eq!(rcode, wire::RCODE_SERVFAIL);
    }

    #[tokio::test]
    #[traced_test]
    async fn queries_land_in_the_log() {
        let server = server();
        ask(&server, "printer.lan", RecordType::A).await;
        ask(&server, "ads.example.com", RecordType::A).await;
        let recent = server.log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].name, "ads.example.com");
        assert_eq!(recent[0].disposition, QueryDisposition::Blocked);
        assert_eq!(recent[1].disposition, QueryDisposition::Local);
    }

    #[tokio::test]
    #[traced_test]
    async fn udp_listener_end_to_end() {
        let server = server();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(run_udp(Arc::clone(&server), socket, cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = wire::build_query(7, "printer.lan", RecordType::A);
        client.send_to(&query, addr).await.unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .map(|l| (l, ()))
            .unwrap();
        let (header, answers) = wire::parse_answers(&buf[..len]).unwrap();
        assert_eq!(header.id, 7);
        assert_eq!(answers[0].rdata, RData::A(Ipv4Addr::new(192, 168, 1, 100)));
        cancel.cancel();
    }
}
