use std::io::{self, BufRead};

use anyhow::{bail, Result};
use log::{error, info, warn};

use halofit_link::btle::BtlePlatform;
use halofit_link::link::{DeviceLink, LinkConfig};
use halofit_link::types::LinkEvent;
use halofit_link::workout::WorkoutSummary;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=halofit_link=debug cargo run --features btle
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    // Automatic reconnect after the headband walks out of range and back.
    let config = LinkConfig {
        reconnect_on_link_loss: true,
        ..LinkConfig::default()
    };

    // ── Connect ───────────────────────────────────────────────────────────────
    let link = DeviceLink::new(BtlePlatform, config);
    let mut rx = link.events();

    info!("Connecting to {} …", link.config().device_name);
    if !link.connect().await {
        let reason = link
            .last_failure()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".into());
        bail!("could not start connecting: {reason}");
    }
    info!("Commands (type + Enter):");
    info!("  q  – quit");
    info!("  <any other string> – send as raw command\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (a StdinLock is not Send) and
    // relayed to an async task.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let link_cmd = link.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            match line.as_str() {
                "" => continue,
                "q" => {
                    info!("Quit requested.");
                    link_cmd.disconnect().await;
                    link_cmd.destroy();
                    break;
                }
                cmd => {
                    info!("Sending command: '{cmd}'");
                    if let Err(e) = link_cmd.send_command(cmd).await {
                        error!("Command error: {e}");
                    }
                }
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    // Ends on a disconnect that will not be retried, or when `q` destroys the
    // link and the event channel closes.
    let mut summary = WorkoutSummary::new();
    while let Some(event) = rx.recv().await {
        match event {
            LinkEvent::Connection(true) => info!("✅  Connected, notifications active"),
            LinkEvent::Connection(false) => {
                match link.last_failure() {
                    Some(e) => warn!("❌  Disconnected: {e}"),
                    None => info!("❌  Disconnected."),
                }
                if !link.reconnect_pending() {
                    info!("No reconnect scheduled, exiting.");
                    link.destroy();
                    break;
                }
            }
            LinkEvent::Sample(sample) => {
                let delta = summary.record(&sample);
                println!(
                    "[SAMPLE] ts={:.0} ms  hr={:3} bpm  kcal={:8.2} (+{:.2})  steps={:6} (+{})",
                    sample.timestamp,
                    sample.heart_rate,
                    sample.calories,
                    delta.calories,
                    sample.step_count,
                    delta.step_count
                );
            }
        }
    }

    info!(
        "Workout: {} samples, avg {:.0} bpm, max {} bpm, {:.1} kcal, {} steps",
        summary.samples,
        summary.average_heart_rate,
        summary.max_heart_rate,
        summary.calories,
        summary.step_count
    );
    Ok(())
}
