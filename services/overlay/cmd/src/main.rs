//! RELOAD overlay peer.
//!
//! Accepts and dials links, forwards messages for other peers, answers pings
//! and optionally pings a set of peers at a fixed interval.

#[macro_use]
mod logging;
mod config;

use anyhow::Context;
use clap::Parser;
use config::OverlayConfig;
use logging::OverlayLogFormatter;
use reload_router::{MessageRouter, PingHandler};
use reload_routing::{ForwardingCore, MemoryPathCompressor, StaticTopology, TopologyLinkEvents};
use reload_session::ConnectionManager;
use reload_wire::{
    overlay_hash, CodecRegistry, Content, ContentType, MessageCodec, NodeId, NullSigner,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// RELOAD overlay peer
#[derive(Parser, Debug)]
#[command(name = "reload-overlay", version, about = "RELOAD overlay peer")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "overlay.yaml")]
    config: PathBuf,

    /// Node id in hex (overrides the config file)
    #[arg(long)]
    node_id: Option<String>,

    /// Listen address, e.g. 0.0.0.0:6084
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer to dial, e.g. 127.0.0.1:6085 (repeatable)
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// Overlay name
    #[arg(long)]
    overlay: Option<String>,

    /// Pending request lifetime, e.g. 3s
    #[arg(long)]
    request_timeout: Option<humantime::Duration>,

    /// Link ACK timeout before the first RTT sample, e.g. 3s
    #[arg(long)]
    link_timeout: Option<humantime::Duration>,

    /// Node id (hex) to ping periodically (repeatable)
    #[arg(long)]
    ping: Vec<String>,

    /// Interval between pings
    #[arg(long, default_value = "10s")]
    ping_interval: humantime::Duration,

    /// Interval between statistics log lines; 0s disables them
    #[arg(long, default_value = "60s")]
    stats_interval: humantime::Duration,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command line flags win over file and environment
    fn apply(&self, config: &mut OverlayConfig) {
        if let Some(node_id) = &self.node_id {
            config.node.node_id = Some(node_id.clone());
        }
        if let Some(listen) = self.listen {
            config.node.listen = Some(listen);
        }
        config.node.bootstrap.extend(self.connect.iter().copied());
        if let Some(overlay) = &self.overlay {
            config.overlay.name = overlay.clone();
        }
        if let Some(timeout) = self.request_timeout {
            config.router.request_timeout_ms = Duration::from(timeout).as_millis() as u64;
        }
        if let Some(timeout) = self.link_timeout {
            config.link.initial_timeout_ms = Duration::from(timeout).as_millis() as u64;
        }
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let mut filter = EnvFilter::new("info");
            for target in [
                "reload_overlay",
                "reload_router",
                "reload_routing",
                "reload_session",
                "reload_wire",
            ] {
                filter = filter.add_directive(format!("{}={}", target, level).parse()?);
            }
            filter
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(OverlayLogFormatter::new("overlay"))
        .init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting RELOAD overlay peer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = OverlayConfig::load_from_file(&args.config)?;
    args.apply(&mut config);

    let node_id = config.node_id()?;
    let overlay = overlay_hash(&config.overlay.name);
    component_info!(
        "node",
        node_id = %node_id,
        overlay = %config.overlay.name,
        overlay_hash = %format!("{:#010x}", overlay),
        "node identity"
    );

    // Codecs
    let codecs = CodecRegistry::new(config.wire_config());
    let codec = codecs.get::<MessageCodec>();

    // Topology and static routes
    let topology = Arc::new(StaticTopology::new(
        node_id.clone(),
        config.overlay.resource_id_length,
    ));
    for route in &config.routes {
        let (destination, via) = route.parse()?;
        topology.add_route(destination, via);
    }

    // Links
    let manager = ConnectionManager::new(config.session_config(node_id.clone()));
    manager.add_event_handler(Arc::new(TopologyLinkEvents::new(topology.clone())));

    // Forwarding and message routing
    let forwarding = Arc::new(
        ForwardingCore::new(
            node_id.clone(),
            overlay,
            codec,
            topology.clone(),
            topology.clone(),
            manager.clone(),
        )
        .with_compressor(Arc::new(MemoryPathCompressor::new())),
    );
    let router = MessageRouter::new(config.router_config(), forwarding, Arc::new(NullSigner));
    manager.set_inbound_handler(router.clone());
    manager.add_event_handler(router.clone());

    router.register_handler(ContentType::PingRequest, Arc::new(PingHandler));

    if let Some(addr) = config.node.listen {
        let bound = manager
            .listen(addr)
            .await
            .with_context(|| format!("cannot listen on {}", addr))?;
        component_info!("node", addr = %bound, "listening for links");
    }

    let mut tasks: Vec<JoinHandle<()>> = config
        .node
        .bootstrap
        .iter()
        .map(|addr| {
            component_info!("node", addr = %addr, "dialing peer");
            manager.dial(*addr)
        })
        .collect();

    let ping_interval = Duration::from(args.ping_interval);
    anyhow::ensure!(
        args.ping.is_empty() || !ping_interval.is_zero(),
        "ping interval must not be zero"
    );
    for peer in &args.ping {
        let target =
            NodeId::from_hex(peer).with_context(|| format!("invalid ping target {}", peer))?;
        tasks.push(tokio::spawn(ping_loop(router.clone(), target, ping_interval)));
    }

    let stats_interval = Duration::from(args.stats_interval);
    if !stats_interval.is_zero() {
        tasks.push(tokio::spawn(stats_loop(router.clone(), stats_interval)));
    }

    component_info!("node", "overlay peer started");
    tokio::signal::ctrl_c().await?;
    component_info!("node", "shutdown requested");

    router.shutdown();
    manager.shutdown();
    for task in tasks {
        task.abort();
    }
    log_stats(&router);

    info!("RELOAD overlay peer stopped");
    Ok(())
}

async fn ping_loop(router: Arc<MessageRouter>, target: NodeId, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if router.is_shutting_down() {
            break;
        }

        let started = Instant::now();
        let request = router.builder().request_to(target.clone(), Content::ping());
        let response = match router.send_request_message(request) {
            Ok(response) => response,
            Err(e) => {
                component_warn!("ping", peer = %target, error = %e, "cannot send ping");
                continue;
            }
        };

        match response.await {
            Ok(answer) => match answer.content.as_error() {
                None => component_info!(
                    "ping",
                    peer = %target,
                    rtt_ms = started.elapsed().as_millis() as u64,
                    "ping answered"
                ),
                Some(error) => component_warn!(
                    "ping",
                    peer = %target,
                    code = %error.code,
                    info = %error.info_text(),
                    "ping rejected"
                ),
            },
            Err(e) => component_warn!("ping", peer = %target, error = %e, "ping failed"),
        }
    }
}

async fn stats_loop(router: Arc<MessageRouter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        log_stats(&router);
    }
}

fn log_stats(router: &MessageRouter) {
    match serde_json::to_string(&router.stats()) {
        Ok(stats) => component_info!("stats", "{}", stats),
        Err(e) => component_error!("stats", error = %e, "cannot serialize statistics"),
    }
}
