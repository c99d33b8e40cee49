#![allow(clippy::cognitive_complexity)]
//! The `haven` binary: wire everything together and run.
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use conflict_detect::{
    wire::find_interface, ArpAnnouncer, ConflictTable, NullAnnouncer, NullProber, ProbeEngine,
    Prober,
};
use dns_proxy::DnsServer;
use dynconfig::{Bootstrap, ConfigStore, Section};
use ha::{HaController, HaHandle};
use haven_core::event::{Bus, Event, EventKind, ServerInfo};
use haven_core::WriteGate;
use lease_engine::{run_gc, DhcpService, LeaseEngine, RequestMeta};
use port_rules::RuleEngine;
use store::Store;

mod dhcp_listener;
mod setup;

/// Authoritative DHCPv4 server with HA failover and an embedded DNS
/// proxy.
#[derive(Debug, Parser)]
#[command(name = "haven", version, about)]
struct Cli {
    /// bootstrap configuration file
    #[arg(short, long, env = "HAVEN_CONFIG", default_value = "/etc/haven/haven.toml")]
    config: PathBuf,

    /// stay attached to the terminal (supervisors want this)
    #[arg(long, default_value_t = true)]
    foreground: bool,

    /// write a commented example bootstrap file and exit
    #[arg(long)]
    setup: bool,

    /// log as JSON lines
    #[arg(long, env = "HAVEN_LOG_JSON")]
    log_json: bool,

    /// worker threads; logical CPUs when unset
    #[arg(long, env = "HAVEN_THREADS")]
    threads: Option<usize>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if cli.setup {
        return match setup::write_example(&cli.config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(%err, "setup failed");
                ExitCode::from(1)
            }
        };
    }

    let mut builder = Builder::new_multi_thread();
    builder.thread_name("haven-worker").enable_all();
    if let Some(threads) = cli.threads {
        builder.worker_threads(threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "failed to build runtime");
            return ExitCode::from(1);
        }
    };

    rt.block_on(async move {
        match start(cli).await {
            Ok(code) => code,
            Err(err) => {
                error!(%err, "startup failed");
                ExitCode::from(1)
            }
        }
    })
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn start(cli: Cli) -> Result<ExitCode> {
    let boot = match Bootstrap::load(&cli.config) {
        Ok(boot) => boot,
        Err(err) => {
            error!(config = %cli.config.display(), %err, "cannot read bootstrap config");
            return Ok(ExitCode::from(1));
        }
    };
    let node = if boot.server.node_name.is_empty() {
        "haven".to_string()
    } else {
        boot.server.node_name.clone()
    };
    info!(node, config = %cli.config.display(), "starting");

    // a storage open failure is fatal with its own exit code
    let store = match Store::open(&boot.server.lease_db, &Section::buckets()) {
        Ok(store) => store,
        Err(err) => {
            error!(path = %boot.server.lease_db.display(), %err, "cannot open lease database");
            return Ok(ExitCode::from(2));
        }
    };

    if let Some(pid_file) = &boot.server.pid_file {
        if let Err(err) = std::fs::write(pid_file, std::process::id().to_string()) {
            warn!(path = %pid_file.display(), %err, "cannot write pid file");
        }
    }

    let cancel = CancellationToken::new();
    let bus = Bus::new();
    bus.start();

    let cfg = ConfigStore::load(store.clone()).context("loading dynamic config")?;
    cfg.start(cancel.clone());

    // conflict detection: a wire prober when we can open the datalink
    // channel, otherwise allocations proceed unprobed
    let params = cfg.conflict_params();
    let (prober, announcer): (Arc<dyn Prober>, Arc<dyn ArpAnnouncer>) = if params.enabled {
        match build_wire_prober(&boot, params.icmp_fallback) {
            Ok((prober, announcer)) => (prober, announcer),
            Err(err) => {
                warn!(%err, "wire probing unavailable, conflict probing disabled");
                (Arc::new(NullProber), Arc::new(NullAnnouncer))
            }
        }
    } else {
        (Arc::new(NullProber), Arc::new(NullAnnouncer))
    };
    let table = Arc::new(
        ConflictTable::open(store.clone(), bus.clone(), params.clone(), node.clone())
            .context("rehydrating conflict table")?,
    );
    let probe = Arc::new(ProbeEngine::new(prober, params));

    let engine = Arc::new(LeaseEngine::new(
        store.clone(),
        Arc::clone(&table),
        Arc::clone(&probe),
        cfg.clone(),
        bus.clone(),
    ));

    // HA: gate every mutating surface through the controller's handle
    let gate: Arc<dyn WriteGate> = if boot.ha.enabled {
        let handle = HaHandle::new(boot.ha.role, boot.ha.peer_url.clone(), bus.clone(), node.clone());
        let controller = HaController::new(
            Arc::clone(&engine),
            cfg.clone(),
            bus.clone(),
            handle.clone(),
            boot.ha.clone(),
            boot.heartbeat_interval(),
            boot.failover_timeout(),
            node.clone(),
            cancel.clone(),
        );
        controller.start();
        info!(role = %boot.ha.role, "ha controller started");
        Arc::new(handle)
    } else {
        Arc::new(HaHandle::standalone(bus.clone(), node.clone()))
    };

    // DHCP wire service
    let service = Arc::new(DhcpService::new(
        Arc::clone(&engine),
        cfg.clone(),
        Arc::clone(&gate),
        announcer,
        boot.server.server_id,
    ));
    let dhcp_socket = dhcp_listener::bind(boot.server.bind_address)
        .await
        .with_context(|| format!("binding dhcp socket {}", boot.server.bind_address))?;
    tokio::spawn(dhcp_listener::run(
        Arc::clone(&service),
        dhcp_socket,
        RequestMeta {
            iface_ip: boot.server.server_id,
        },
        cancel.clone(),
    ));

    // DNS proxy
    let dns_cfg = cfg.dns_proxy();
    let ddns = cfg.ddns();
    let dns: Option<Arc<DnsServer>> = if dns_cfg.enabled {
        let server = dns_proxy::build(&dns_cfg, &ddns.domain, ddns.ttl_secs, ddns.add_ptr);
        dns_proxy::subscribe_lease_events(Arc::clone(&server.zone), &bus, cancel.clone());

        let udp = UdpSocket::bind(dns_cfg.listen)
            .await
            .with_context(|| format!("binding dns udp {}", dns_cfg.listen))?;
        tokio::spawn(dns_proxy::run_udp(Arc::clone(&server), udp, cancel.clone()));
        let tcp = TcpListener::bind(dns_cfg.listen)
            .await
            .with_context(|| format!("binding dns tcp {}", dns_cfg.listen))?;
        tokio::spawn(dns_proxy::run_tcp(Arc::clone(&server), tcp, cancel.clone()));

        tokio::spawn(dns_proxy::run_refresher(
            Arc::clone(&server.blocklists),
            cancel.clone(),
        ));
        tokio::spawn(dns_proxy::run_health_probe(
            Arc::clone(&server.forwarder),
            cancel.clone(),
        ));
        // periodic cache hygiene
        let cache = Arc::clone(&server.cache);
        let purge_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "dns cache entries purged");
                        }
                    }
                    _ = purge_cancel.cancelled() => break,
                }
            }
        });
        Some(server)
    } else {
        None
    };

    // port-automation rules
    let rules = Arc::new(RuleEngine::new(cfg.port_rules()));
    port_rules::subscribe_lease_events(Arc::clone(&rules), &bus, cancel.clone());

    // config changes refresh every derived component
    {
        let cfg_for_rebuild = cfg.clone();
        let table = Arc::clone(&table);
        let probe = Arc::clone(&probe);
        let rules = Arc::clone(&rules);
        let dns = dns.clone();
        cfg.on_change(move || {
            let params = cfg_for_rebuild.conflict_params();
            table.set_params(params.clone());
            probe.set_params(params);
            rules.set_rules(cfg_for_rebuild.port_rules());
            if let Some(dns) = &dns {
                let dns_cfg = cfg_for_rebuild.dns_proxy();
                dns.forwarder.set_servers(&dns_cfg.upstreams);
                dns.blocklists.set_sources(dns_cfg.blocklists);
            }
            debug!("derived component state rebuilt after config change");
        });
    }

    // lease + conflict GC
    let gc_interval = Duration::from_secs(cfg.defaults().lease_gc_interval_secs.max(1));
    tokio::spawn(run_gc(Arc::clone(&engine), gc_interval, cancel.clone()));

    bus.publish(Event::server(
        EventKind::ServerStarted,
        ServerInfo {
            node: node.clone(),
            state: None,
        },
        "startup complete",
    ));
    info!(
        dhcp = %boot.server.bind_address,
        dns = ?dns_cfg.enabled.then_some(dns_cfg.listen),
        ha = boot.ha.enabled,
        "serving"
    );

    wait_for_shutdown().await;
    info!("shutting down");
    bus.publish(Event::server(
        EventKind::ServerStopping,
        ServerInfo {
            node,
            state: None,
        },
        "signal received",
    ));
    cancel.cancel();
    bus.stop();
    // let in-flight transactions and subscribers drain
    tokio::time::sleep(Duration::from_millis(200)).await;

    if let Some(pid_file) = &boot.server.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }
    Ok(ExitCode::SUCCESS)
}

/// Open the datalink prober on the configured (or first usable)
/// interface.
fn build_wire_prober(
    boot: &Bootstrap,
    icmp_fallback: bool,
) -> haven_core::error::Result<(Arc<dyn Prober>, Arc<dyn ArpAnnouncer>)> {
    let iface = find_interface(boot.server.interface.as_deref())?;
    let src_ip = iface
        .ips
        .iter()
        .find_map(|net| match net.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            _ => None,
        })
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    let prober = Arc::new(conflict_detect::wire::ArpProber::new(
        &iface,
        src_ip,
        icmp_fallback,
    )?);
    info!(iface = %iface.name, %src_ip, "arp prober ready");
    Ok((Arc::clone(&prober) as Arc<dyn Prober>, prober))
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(%err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("SIGINT"),
        _ = term.recv() => debug!("SIGTERM"),
    }
}
