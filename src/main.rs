use alarmpanel::config::Settings;
use alarmpanel::mqtt::mqtt_handler::RumqttConnector;
use alarmpanel::persistence::FileModeStore;
use alarmpanel::{Action, PanelHandle, PanelNotice, PanelOptions};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let settings_path = Settings::default_path();
    Settings::ensure_default(&settings_path).await?;
    let settings = Settings::load(&settings_path).await?;
    info!(
        "Loaded settings from {}, broker {}",
        settings_path.display(),
        settings.to_session_config()
    );

    let store = FileModeStore::open(settings.mode_file(&settings_path))
        .map_err(|e| eyre!("Failed to open mode store: {}", e))?;
    let connector = RumqttConnector::new(settings.reconnect_policy());
    let audit_path = settings.audit_file(&settings_path);

    let (panel, mut streams) = PanelHandle::spawn(PanelOptions {
        settings,
        settings_path: Some(settings_path),
        connector: Arc::new(connector),
        store: Arc::new(store),
        audit_path,
    });

    match panel.resume().await {
        Ok(outcome) => info!("Panel resumed: {:?}", outcome),
        Err(e) => error!("Failed to resume panel: {}", e),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }

            action = streams.actions.recv() => match action {
                Some(action) => log_action(&action),
                None => break,
            },

            notice = streams.notices.recv() => match notice {
                Ok(notice) => log_notice(&notice),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} notices", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    panel.dispose().await;
    info!("Panel stopped in mode {}", panel.mode());
    Ok(())
}

fn log_action(action: &Action) {
    match action {
        Action::ShowDisableDialog(secs) => info!("Disarm within {} seconds", secs),
        Action::ShowTriggeredView => warn!("Alarm triggered"),
        Action::PendingCountdownExpired => warn!("Disarm countdown expired"),
        Action::ActivateScreenSaver => debug!("Screensaver on"),
        other => debug!("Action: {:?}", other),
    }
}

fn log_notice(notice: &PanelNotice) {
    match notice {
        PanelNotice::Message { topic, payload, .. } => info!("{} -> {}", topic, payload),
        PanelNotice::Error(message) => error!("{}", message),
        PanelNotice::Disconnected => warn!("Broker disconnected"),
        PanelNotice::Connected => info!("Broker connected"),
        PanelNotice::FirstRun => info!(
            "First start: disarm code set to the default, change it in the settings file"
        ),
    }
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
