//! Panel Handle - the API the presentation layer talks to
//!
//! Every call is turned into a [`PanelCommand`] and queued for the controller
//! task, so commands are applied in the order they were issued and interleave
//! cleanly with broker, timer and connectivity events.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::panel_controller::PanelController;
use crate::alarm::{Action, AlarmMode};
use crate::config::Settings;
use crate::mqtt::message_manager::{AlarmCommand, InboundMessage};
use crate::mqtt::mqtt_handler::{Connector, InitOutcome, SessionError};
use crate::persistence::ModeStore;

const COMMAND_BUFFER: usize = 64;
const NOTICE_BUFFER: usize = 64;

/// Things the presentation layer should tell the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelNotice {
    Message {
        topic: String,
        payload: String,
        id: String,
    },
    Error(String),
    Disconnected,
    Connected,
    /// A default disarm code was set because this is the first start.
    FirstRun,
}

impl From<&InboundMessage> for PanelNotice {
    fn from(message: &InboundMessage) -> Self {
        PanelNotice::Message {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            id: message.id.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Panel controller has stopped")]
    Stopped,
}

/// Requests queued from a [`PanelHandle`] to the controller task.
#[derive(Debug)]
pub enum PanelCommand {
    Publish(AlarmCommand, oneshot::Sender<Result<(), PanelError>>),
    Reconfigure(Box<Settings>, oneshot::Sender<Result<InitOutcome, PanelError>>),
    NetworkChanged(bool),
    Resume(oneshot::Sender<Result<InitOutcome, PanelError>>),
    Suspend,
    UserActivity,
    VerifyCode(String, oneshot::Sender<bool>),
    Dispose(oneshot::Sender<()>),
}

/// Everything the controller needs to start.
pub struct PanelOptions {
    pub settings: Settings,
    /// Where settings changes are saved. `None` keeps them in memory only.
    pub settings_path: Option<PathBuf>,
    pub connector: Arc<dyn Connector>,
    pub store: Arc<dyn ModeStore>,
    pub audit_path: PathBuf,
}

/// Receiving ends handed out once at spawn time, so nothing emitted during
/// startup is missed.
///
/// The action stream is unbounded: every action is delivered however far the
/// presentation layer falls behind.
#[derive(Debug)]
pub struct PanelStreams {
    pub actions: mpsc::UnboundedReceiver<Action>,
    pub notices: broadcast::Receiver<PanelNotice>,
}

#[derive(Debug, Clone)]
pub struct PanelHandle {
    commands: mpsc::Sender<PanelCommand>,
    notices: broadcast::Sender<PanelNotice>,
    mode: watch::Receiver<AlarmMode>,
    task: Arc<std::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl PanelHandle {
    /// Spawns the controller task. Must be called from within a tokio runtime.
    pub fn spawn(options: PanelOptions) -> (Self, PanelStreams) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = broadcast::channel(NOTICE_BUFFER);
        let mode = options.store.subscribe();

        let controller = PanelController::create(options, command_rx, action_tx, notice_tx.clone());
        let task = tokio::spawn(async move {
            let running = controller.start().await;
            let stopped = running.run().await;
            stopped.shutdown();
        });
        info!("Panel controller spawned");

        let handle = Self {
            commands: command_tx,
            notices: notice_tx,
            mode,
            task: Arc::new(std::sync::Mutex::new(Some(task))),
        };
        let streams = PanelStreams {
            actions: action_rx,
            notices: notice_rx,
        };
        (handle, streams)
    }

    pub async fn arm_home(&self) -> Result<(), PanelError> {
        self.publish(AlarmCommand::ArmHome).await
    }

    pub async fn arm_away(&self) -> Result<(), PanelError> {
        self.publish(AlarmCommand::ArmAway).await
    }

    pub async fn disarm(&self) -> Result<(), PanelError> {
        self.publish(AlarmCommand::Disarm).await
    }

    async fn publish(&self, command: AlarmCommand) -> Result<(), PanelError> {
        self.request(|reply| PanelCommand::Publish(command, reply))
            .await?
    }

    /// Applies new settings. An invalid broker config is rejected and leaves
    /// the running session untouched.
    pub async fn reconfigure(&self, settings: Settings) -> Result<InitOutcome, PanelError> {
        self.request(|reply| PanelCommand::Reconfigure(Box::new(settings), reply))
            .await?
    }

    /// Reports raw network reachability from the platform.
    pub async fn network_changed(&self, is_connected: bool) -> Result<(), PanelError> {
        self.commands
            .send(PanelCommand::NetworkChanged(is_connected))
            .await
            .map_err(|_| PanelError::Stopped)
    }

    pub async fn resume(&self) -> Result<InitOutcome, PanelError> {
        self.request(PanelCommand::Resume).await?
    }

    pub async fn suspend(&self) -> Result<(), PanelError> {
        self.commands
            .send(PanelCommand::Suspend)
            .await
            .map_err(|_| PanelError::Stopped)
    }

    /// The user touched the panel: wakes the screen and restarts the
    /// inactivity countdown.
    pub async fn user_activity(&self) -> Result<(), PanelError> {
        self.commands
            .send(PanelCommand::UserActivity)
            .await
            .map_err(|_| PanelError::Stopped)
    }

    pub async fn verify_code(&self, code: &str) -> Result<bool, PanelError> {
        let code = code.to_string();
        self.request(|reply| PanelCommand::VerifyCode(code, reply))
            .await
    }

    /// Stops the controller: pending audits are cancelled, the session is
    /// closed and timers are dropped. Calling it again is a no-op.
    pub async fn dispose(&self) {
        if self.request(PanelCommand::Dispose).await.is_err() {
            debug!("Panel controller already stopped");
        }

        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("Panel controller task failed: {}", e);
            }
        }
    }

    pub fn mode(&self) -> AlarmMode {
        *self.mode.borrow()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<AlarmMode> {
        self.mode.clone()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<PanelNotice> {
        self.notices.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PanelCommand,
    ) -> Result<T, PanelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| PanelError::Stopped)?;
        reply_rx.await.map_err(|_| PanelError::Stopped)
    }
}
