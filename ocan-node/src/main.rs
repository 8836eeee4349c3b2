//! OCAN Node - CLI for the OCPP/CAN security testbed
//!
//! # Usage
//!
//! ```bash
//! # Man-in-the-middle relay between charge points and the CSMS
//! ocan-node relay --listen 127.0.0.1:9001 --upstream ws://localhost:9000 --attack modify-stop
//!
//! # Intrusion detector on the UDP virtual bus
//! ocan-node ids --bind 0.0.0.0:9970
//!
//! # Charging traffic from a compromised charge point
//! ocan-node simulate --peer 127.0.0.1:9970 --compromised
//!
//! # Gateway with and without the admission filter
//! ocan-node compare
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ocan_adapter_ocpp::{
    AttackMode, BusConfig, Direction, FrameCodec, GatewayConfig, GatewayStats, InterceptionRelay,
    ProtocolGateway, RelayConfig,
};
use ocan_core::{
    bus, format_id, ids, BusSocket, CanId, DetectorConfig, Frame, FrameBus, IntrusionDetector,
    TrafficSummary, FRAME_LEN,
};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP/CAN gateway, intrusion detector and interception relay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Relay charge point websockets to the CSMS, optionally tampering with them
    Relay {
        /// Address charge points connect to
        #[arg(long, default_value = "127.0.0.1:9001")]
        listen: SocketAddr,

        /// Real CSMS websocket URL
        #[arg(long, default_value = "ws://localhost:9000")]
        upstream: String,

        /// none, modify-stop, modify-start or inject-fake
        #[arg(long, default_value = "none")]
        attack: AttackMode,

        /// Subprotocol requested upstream when the charge point offers none
        #[arg(long, default_value = "ocpp1.6")]
        subprotocol: String,
    },

    /// Watch the UDP virtual bus for intrusions until Ctrl-C
    Ids {
        /// UDP address to receive frames on
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], bus::DEFAULT_PORT)))]
        bind: SocketAddr,

        /// Seconds between traffic summaries
        #[arg(long, default_value = "30")]
        summary_secs: u64,
    },

    /// Run the same calls through an open and a filtering gateway
    Compare,

    /// Publish charging traffic onto the UDP virtual bus
    Simulate {
        /// Receivers of the simulated frames (can be repeated)
        #[arg(long, default_values_t = [SocketAddr::from(([127, 0, 0, 1], bus::DEFAULT_PORT))])]
        peer: Vec<SocketAddr>,

        /// Emit a 0x9FF frame after every start command
        #[arg(long)]
        compromised: bool,

        /// Flood the bus with this identifier (hex like 0x200 or decimal)
        #[arg(long, value_parser = parse_can_id)]
        flood: Option<CanId>,

        /// Charging sessions to simulate
        #[arg(long, default_value = "3")]
        cycles: u32,

        /// Milliseconds between frames
        #[arg(long, default_value = "200")]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Relay {
            listen,
            upstream,
            attack,
            subprotocol,
        } => run_relay(listen, upstream, attack, subprotocol).await,
        Command::Ids { bind, summary_secs } => run_ids(bind, summary_secs).await,
        Command::Compare => {
            run_compare();
            Ok(())
        }
        Command::Simulate {
            peer,
            compromised,
            flood,
            cycles,
            interval_ms,
        } => {
            let config = peer.into_iter().fold(
                BusConfig::default().with_bind(SocketAddr::from(([0, 0, 0, 0], 0))),
                BusConfig::with_peer,
            );
            run_simulation(config, compromised, flood, cycles, Duration::from_millis(interval_ms)).await
        }
    }
}

async fn run_relay(
    listen: SocketAddr,
    upstream: String,
    attack: AttackMode,
    subprotocol: String,
) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║             OCAN Node - OCPP Interception Relay              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:   {:<50} ║", listen);
    println!("║  Upstream: {:<50} ║", truncate(&upstream, 50));
    println!("║  Attack:   {:<50} ║", attack);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = RelayConfig::new(listen, upstream)
        .with_attack(attack)
        .with_subprotocol(subprotocol);
    let relay = InterceptionRelay::new(config);
    let registry = relay.registry();

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay...");
            info!("Messages relayed: {}", registry.relayed_total());
            for conn in registry.list() {
                info!(
                    "  #{} {} {}: {} to CSMS, {} to CP",
                    conn.id, conn.peer, conn.path, conn.to_csms, conn.to_charge_point
                );
            }
        }
    }

    Ok(())
}

async fn run_ids(bind: SocketAddr, summary_secs: u64) -> Result<(), Box<dyn std::error::Error>> {
    let socket = BusSocket::bind(bind, Vec::new()).await?;
    let frames = FrameBus::default();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               OCAN Node - CAN Intrusion Detector             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Bus:      {:<50} ║", socket.local_addr()?);
    println!("║  Known:    {:<50} ║", truncate(&id_list(&ids::KNOWN), 50));
    println!("║  Summary:  {:<50} ║", format!("every {}s", summary_secs));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = DetectorConfig::default().with_summary_interval(Duration::from_secs(summary_secs));
    let detector = Arc::new(IntrusionDetector::new(config));

    let mut alarms = detector.subscribe_alarms();
    let reporter = tokio::spawn(async move {
        while let Ok(alarm) = alarms.recv().await {
            warn!("[{}] {}: {}", alarm.kind, format_id(alarm.id), alarm.detail);
        }
    });

    let handle = detector.spawn(frames.subscribe());
    let receiver = socket.start_receive(frames);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down intrusion detector...");

    receiver.abort();
    handle.stop();
    reporter.abort();

    print_summary(&detector.summary());
    Ok(())
}

fn print_summary(summary: &TrafficSummary) {
    println!();
    println!("=== CAN-IDS summary ===");
    println!("Total frames:     {}", summary.total_frames);
    println!("Distinct CAN IDs: {}", summary.unique_ids);
    println!("Total alarms:     {}", summary.total_alarms);
    if !summary.top_ids.is_empty() {
        println!("Busiest identifiers:");
        for (id, count) in &summary.top_ids {
            println!("  {}: {}", format_id(*id), count);
        }
    }
    if !summary.recent_alarms.is_empty() {
        println!("Recent alarms:");
        for alarm in &summary.recent_alarms {
            println!(
                "  {} [{}] {}: {}",
                alarm.raised_at.format("%H:%M:%S%.3f"),
                alarm.kind,
                format_id(alarm.id),
                alarm.detail
            );
        }
    }
}

fn run_compare() {
    let insecure = ProtocolGateway::new(GatewayConfig::default());
    let secure = ProtocolGateway::new(GatewayConfig::secure());

    let calls = [
        ("RemoteStartTransaction", json!({"chargePointId": 1, "connectorId": 1})),
        ("RemoteStopTransaction", json!({"transactionId": 1})),
        ("SetChargingProfile", json!({"chargingProfileId": 1, "maxCurrent": 16.0})),
        ("UnlockConnector", json!({"connectorId": 1})),
    ];

    for (label, gateway) in [("Insecure gateway (filter off)", &insecure), ("Secure gateway (filter on)", &secure)] {
        println!();
        println!("=== {} ===", label);
        for (action, payload) in &calls {
            match gateway.forward_action(Direction::CsmsToChargePoint, action, payload.clone()) {
                Ok(frame) => println!("  + {} -> {}", action, frame),
                Err(e) => println!("  - {}: {}", action, e),
            }
        }

        let malicious = Frame::new(ids::MALICIOUS, [0xFF; FRAME_LEN]);
        match gateway.forward_raw(Direction::CsmsToChargePoint, malicious) {
            Ok(frame) => println!("  ! malicious frame passed: {}", frame),
            Err(e) => println!("  + malicious frame stopped: {}", e),
        }
    }

    println!();
    println!("=== Statistics ===");
    print_stats("Insecure", insecure.stats());
    print_stats("Secure", secure.stats());
}

fn print_stats(label: &str, stats: GatewayStats) {
    println!(
        "  {:<9} processed={} forwarded={} blocked={}",
        label, stats.processed, stats.forwarded, stats.blocked
    );
}

async fn run_simulation(
    config: BusConfig,
    compromised: bool,
    flood: Option<CanId>,
    cycles: u32,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = BusSocket::bind(config.bind_addr, config.peers).await?;
    let codec = FrameCodec;

    info!(
        "Simulating {} charging sessions toward {:?}{}",
        cycles,
        socket.peers(),
        if compromised { " (compromised firmware)" } else { "" }
    );

    if let Some(id) = flood {
        warn!("Flooding bus with {}", format_id(id));
        for _ in 0..cycles.saturating_mul(100) {
            socket.send(&Frame::new(id, [0; FRAME_LEN])).await?;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        return Ok(());
    }

    let send = |action: &str, payload: Value| -> Result<Frame, Box<dyn std::error::Error>> {
        let (id, data) = codec.encode(action, &payload)?;
        Ok(Frame::new(id, data))
    };

    socket
        .send(&send("BootNotification", json!({"chargePointId": 1, "model": "EK3"}))?)
        .await?;
    pause(interval).await;

    for cycle in 1..=cycles {
        let transaction = cycle;
        socket
            .send(&send("StatusNotification", json!({"connectorId": 1, "status": "Preparing"}))?)
            .await?;
        pause(interval).await;

        socket
            .send(&send("RemoteStartTransaction", json!({"chargePointId": 1, "connectorId": 1}))?)
            .await?;
        if compromised {
            warn!("Compromised firmware: emitting {}", format_id(ids::MALICIOUS));
            socket.send(&Frame::new(ids::MALICIOUS, [0xFF; FRAME_LEN])).await?;
        }
        pause(interval).await;

        socket
            .send(&send("SetChargingProfile", json!({"chargingProfileId": 1, "maxCurrent": 16.0}))?)
            .await?;
        socket
            .send(&send("StatusNotification", json!({"connectorId": 1, "status": "Charging"}))?)
            .await?;
        pause(interval).await;

        let mut energy: u32 = 0;
        for tick in 0..5u32 {
            energy += rand::thread_rng().gen_range(80..120);
            let meter = json!({"connectorId": 1, "energy": energy, "timestamp": tick});
            socket.send(&send("MeterValues", meter)?).await?;
            pause(interval).await;
        }

        socket
            .send(&send("RemoteStopTransaction", json!({"transactionId": transaction}))?)
            .await?;
        socket
            .send(&send("StatusNotification", json!({"connectorId": 1, "status": "Finishing"}))?)
            .await?;
        pause(interval).await;

        socket
            .send(&send("StatusNotification", json!({"connectorId": 1, "status": "Available"}))?)
            .await?;
        info!("Charging session {} done ({} Wh)", cycle, energy);
        pause(interval).await;
    }

    Ok(())
}

/// Sleep for `base` plus up to 20% jitter
async fn pause(base: Duration) {
    let jitter = rand::thread_rng().gen_range(0.0..0.2);
    tokio::time::sleep(base.mul_f64(1.0 + jitter)).await;
}

fn parse_can_id(s: &str) -> Result<CanId, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => CanId::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid CAN ID '{}': {}", s, e))
}

fn id_list(list: &[CanId]) -> String {
    list.iter().map(|id| format_id(*id)).collect::<Vec<_>>().join(" ")
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("0x9FF"), Ok(0x9FF));
        assert_eq!(parse_can_id("512"), Ok(0x200));
        assert!(parse_can_id("0xZZ").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ws://a-very-long-host:9000", 10), "ws://a-...");

        let upstream = format!("ws://{}/istasyon-ş", "a".repeat(44));
        let cut = truncate(&upstream, 50);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 50);
        assert_eq!(truncate("şşşş", 3), "...");
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::parse_from(["ocan-node", "relay", "--attack", "inject-fake"]);
        match args.command {
            Command::Relay { attack, listen, .. } => {
                assert_eq!(attack, AttackMode::inject_fake());
                assert_eq!(listen.port(), 9001);
            }
            other => panic!("unexpected {:?}", other),
        }

        let args = Args::parse_from(["ocan-node", "simulate", "--flood", "0x200", "--compromised"]);
        match args.command {
            Command::Simulate { flood, compromised, peer, .. } => {
                assert_eq!(flood, Some(0x200));
                assert!(compromised);
                assert_eq!(peer.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
