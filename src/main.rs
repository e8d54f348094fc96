//! ota-sim: run the OTA engines against each other on a simulated network.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  LoopbackNet       NorFlashStaging   SimDevice    ImageStore   │
//! │  (ZCL + ZDO)       (MemFlash)        (reset/rng)  (provider)   │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │       OtaServer  ◀── ZCL OTA cluster ──▶  OtaClient × N │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Simulation (virtual clock, latency, delivery trace)           │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `ota-sim [CONFIG_JSON] [PAYLOAD_BYTES] [CLIENTS]`
#![deny(unused_must_use)]

use anyhow::{Context, Result, bail};
use log::{info, warn};

use zcl_ota::adapters::image_store::{ImageStore, build_ota_file};
use zcl_ota::config::OtaConfig;
use zcl_ota::protocol::{FileId, ImageNotify, PeerAddr};
use zcl_ota::sim::Simulation;

const DEFAULT_PAYLOAD: usize = 4096;
const DEFAULT_CLIENTS: usize = 1;
/// Virtual time budget for the whole run.
const RUN_LIMIT_MS: u64 = 6 * 60 * 60 * 1000;

fn load_config(path: Option<&str>) -> Result<OtaConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {path}"))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {path}"))?
        }
        None => OtaConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn parse_count(arg: Option<&String>, default: usize, what: &str) -> Result<usize> {
    match arg {
        Some(s) => s.parse().with_context(|| format!("invalid {what}: {s}")),
        None => Ok(default),
    }
}

fn main() -> Result<()> {
    // ── 1. Logging ────────────────────────────────────────────
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("╔══════════════════════════════════════╗");
    info!("║  ota-sim v{}                       ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Arguments and configuration ────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = args.first().filter(|a| a.as_str() != "-").map(String::as_str);
    let config = load_config(config_path)?;
    let payload_len = parse_count(args.get(1), DEFAULT_PAYLOAD, "payload size")?;
    let clients = parse_count(args.get(2), DEFAULT_CLIENTS, "client count")?;
    if clients == 0 {
        bail!("at least one client is required");
    }

    // ── 3. Build the new image ────────────────────────────────
    let current = config.client.current_file_id();
    let next = FileId::new(
        current.manufacturer,
        current.image_type,
        current.version.wrapping_add(1),
    );
    let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    let file = build_ota_file(next, config.client.current_stack_version, &payload)
        .map_err(zcl_ota::error::Error::from)?;
    info!("Image v0x{:08X}: {} bytes on the wire", next.version, file.len());

    let mut store = ImageStore::new();
    store.add_image(next, file);

    // ── 4. Network ────────────────────────────────────────────
    let mut sim = Simulation::new(config.server.clone(), store);
    for i in 0..clients {
        let short_addr = 0x1001 + i as u16;
        sim.add_client(config.client.clone(), short_addr, 0x5EED + i as u32);
    }
    sim.start();

    let broadcast = PeerAddr::new(PeerAddr::BROADCAST, config.client.endpoint);
    if !sim.send_image_notify(broadcast, &ImageNotify::for_file(next, 100)) {
        warn!("Image Notify was not sent; clients will find the image by polling");
    }

    // ── 5. Run ────────────────────────────────────────────────
    let finished = sim.run_to_completion(RUN_LIMIT_MS);
    info!(
        "Simulation stopped at {} ms ({} frames delivered, {} dropped)",
        sim.now_ms(),
        sim.trace().len(),
        sim.dropped()
    );

    for (i, client) in sim.clients().iter().enumerate() {
        match client.sink.last_finish() {
            Some(status) => info!(
                "client 0x{:04X}: {:?}, {} reset(s)",
                client.net.short_addr(),
                status,
                client.device.resets()
            ),
            None => warn!("client {i} never finished ({:?})", client.engine.status()),
        }
    }

    if !finished {
        bail!("not every client finished within {RUN_LIMIT_MS} ms of virtual time");
    }
    Ok(())
}
