use std::sync::Arc;

use color_eyre::Result;
use pumpwatch::monitor::PumpMonitorHandle;
use pumpwatch::persistence::ConfigPortal;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_portal = Arc::new(ConfigPortal::load().await?);
    let settings = config_portal.connection_settings().await;
    info!(
        "Loaded connection settings: {}:{} as {}",
        settings.host,
        settings.port,
        settings.client_id()
    );

    let monitor = PumpMonitorHandle::spawn(config_portal).await;
    monitor.connect().await?;

    let mut snapshots = monitor.subscribe();
    let mut last_status = String::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                monitor.disconnect().await?;
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow().clone();
                if snapshot.status_text != last_status {
                    info!("Status: {}", snapshot.status_text);
                    last_status = snapshot.status_text.clone();
                }
                if let Some(stats) = snapshot.stats {
                    debug!(
                        "Brightness window: min {:.2} / avg {:.2} / max {:.2} over {} samples",
                        stats.min,
                        stats.average,
                        stats.max,
                        snapshot.brightness_logs.len()
                    );
                }
            }
        }
    }

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
