mod actuator;
mod command;
mod config;
mod control;
mod relay;
mod sensor;
mod session;
mod sim;
mod telemetry;
mod thresholds;
mod topics;

use anyhow::Result;
use std::env;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuator;
use control::Controller;
use sensor::Acquisition;
use session::Session;
use sim::SimSensors;
use telemetry::Telemetry;
use topics::Topics;

/// Commands buffered between the session driver and the control loop.
const COMMAND_QUEUE: usize = 16;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Pump relay ──────────────────────────────────────────────────
    // Validation guarantees the pin is in 2..=27.
    let relay = relay::open(cfg.relay.gpio_pin as u8, cfg.relay.active_low)?;
    let actuator = Actuator::new(relay, cfg.timing.max_irrigation());

    // ── Sensors ─────────────────────────────────────────────────────
    let hardware = SimSensors::new(
        cfg.sim.scenario(),
        cfg.calibration,
        cfg.sim.diurnal_period_s,
    );
    let acquisition = Acquisition::new(hardware, cfg.calibration);

    // ── MQTT ────────────────────────────────────────────────────────
    let topics = Topics::new(&cfg.device.farm_id, &cfg.device.device_id);
    let client_id = format!("agri-node-{}", cfg.device.device_id);
    let session = Session::new(&cfg.mqtt, &client_id, &topics);
    let mut link = session.link();
    let (command_tx, mut command_rx) = mpsc::channel(COMMAND_QUEUE);
    tokio::spawn(session.run(command_tx));

    let grace = std::time::Duration::from_secs(cfg.mqtt.connect_grace_s);
    if tokio::time::timeout(grace, link.ensure_connected())
        .await
        .is_err()
    {
        warn!(
            grace_sec = cfg.mqtt.connect_grace_s,
            state = ?link.state(),
            "broker not reachable yet; starting offline, the session keeps retrying"
        );
    }

    // ── Control loop ────────────────────────────────────────────────
    let mut controller = Controller::new(
        acquisition,
        cfg.thresholds,
        actuator,
        Telemetry::new(&topics),
        &cfg.timing,
    );

    controller
        .run(&link, &mut command_rx, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutdown requested");
        })
        .await;

    Ok(())
}
