use doorbell_sip::application::DoorbellSipManager;
use doorbell_sip::config::{Config, DoorbellMode};
use doorbell_sip::domain::doorbell::DoorbellEventKind;
use doorbell_sip::domain::shared::DomainEvent;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "doorbell.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = Config::load(Some(&path))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting doorbell SIP ({:?} mode)", config.doorbell.mode);
    info!("Configuration loaded from {:?}", path);

    let manager = DoorbellSipManager::start(&config).await?;
    if let Some(addr) = manager.local_addr().await {
        info!("Listening for SIP on {}", addr);
    }

    let mut events = manager.subscribe();
    let auto_answer = config.doorbell.auto_answer;
    let delay = Duration::from_millis(config.doorbell.auto_answer_delay_ms);
    let event_manager = manager.clone();
    let event_loop = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} event(s)", n);
                    continue;
                }
                Err(_) => break,
            };

            match serde_json::to_string(&event) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Cannot encode {} event: {}", event.event_type(), e),
            }

            if auto_answer && matches!(event.kind, DoorbellEventKind::Ringing { .. }) {
                let manager = event_manager.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    manager.answer().await;
                });
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if manager.mode() == DoorbellMode::Client && !manager.unregister().await {
        warn!("Unregister failed");
    }
    manager.stop().await;
    event_loop.abort();

    info!("Doorbell SIP stopped");
    Ok(())
}
