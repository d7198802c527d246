//! Panel controller with statum state machine for its lifecycle
//!
//! The controller is the only owner of the alarm mode, the broker session,
//! the timers and the connectivity monitor. Everything that can change them
//! arrives as a message on one of its queues and is handled to completion
//! before the next message is looked at.
//!
//! # State Machine
//!
//! ```text
//! Initializing ──► Running ──► Stopped
//!  (first run,      (event     (audits cancelled,
//!   restore mode)    loop)      session closed)
//! ```
//!
//! # Queues
//!
//! ```text
//! PanelHandle ──[PanelCommand]──┐
//! Session     ──[SessionEvent]──┤
//! Timers      ──[TimerFired]────┼──► PanelController ──► Action stream
//! Network     ──[bool]──────────┤                    └─► PanelNotice broadcast
//! Audit       ──[AuditError]────┘
//! ```

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::panel_handle::{PanelCommand, PanelError, PanelNotice, PanelOptions};
use crate::alarm::{transition, Action, AlarmMode, TimerFired, TimerPurpose, TimerScheduler};
use crate::config::Settings;
use crate::connectivity::{spawn_reachability_check, ConnectivityEvent, ConnectivityMonitor};
use crate::mqtt::message_manager::{AlarmPayload, InboundMessage, ERROR_SENTINEL};
use crate::mqtt::mqtt_handler::{Delivery, InitOutcome, SessionEvent, SessionManager};
use crate::persistence::{AuditRecorder, ModeStore, SharedAuditError};

#[state]
#[derive(Debug, Clone)]
pub enum PanelState {
    Initializing, // Channels wired, nothing restored yet
    Running,      // Processing queues
    Stopped,      // Loop left, resources still held until shutdown
}

/// Running reachability check.
pub struct ReachabilityCheck {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[machine]
pub struct PanelController<S: PanelState> {
    settings: Settings,
    settings_path: Option<PathBuf>,
    mode: AlarmMode,
    store: Arc<dyn ModeStore>,
    sessions: SessionManager,
    timers: TimerScheduler,
    connectivity: ConnectivityMonitor,
    audit: AuditRecorder,
    reachability: Option<ReachabilityCheck>,
    commands: mpsc::Receiver<PanelCommand>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    timer_fires: mpsc::UnboundedReceiver<TimerFired>,
    audit_errors: mpsc::UnboundedReceiver<SharedAuditError>,
    reach_tx: mpsc::UnboundedSender<bool>,
    reach_reports: mpsc::UnboundedReceiver<bool>,
    actions: mpsc::UnboundedSender<Action>,
    notices: broadcast::Sender<PanelNotice>,
    dispose_reply: Option<oneshot::Sender<()>>,
}

impl<S: PanelState> PanelController<S> {
    fn notify(&self, notice: PanelNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn forward(&self, action: Action) {
        if self.actions.send(action).is_err() {
            debug!("Action stream closed, dropping {:?}", action);
        }
    }

    fn stop_reachability_check(&mut self) {
        if let Some(check) = self.reachability.take() {
            check.token.cancel();
            debug!("Stopped reachability check (finished: {})", check.handle.is_finished());
        }
    }
}

impl PanelController<Initializing> {
    pub(crate) fn create(
        options: PanelOptions,
        commands: mpsc::Receiver<PanelCommand>,
        actions: mpsc::UnboundedSender<Action>,
        notices: broadcast::Sender<PanelNotice>,
    ) -> Self {
        let (session_tx, session_events) = mpsc::unbounded_channel();
        let (timer_tx, timer_fires) = mpsc::unbounded_channel();
        let (audit_tx, audit_errors) = mpsc::unbounded_channel();
        let (reach_tx, reach_reports) = mpsc::unbounded_channel();

        let mode = options.store.get();
        Self::new(
            options.settings,
            options.settings_path,
            mode,
            options.store,
            SessionManager::new(options.connector, session_tx),
            TimerScheduler::new(timer_tx),
            ConnectivityMonitor::new(),
            AuditRecorder::new(options.audit_path, audit_tx),
            None, // reachability
            commands,
            session_events,
            timer_fires,
            audit_errors,
            reach_tx,
            reach_reports,
            actions,
            notices,
            None, // dispose_reply
        )
    }

    /// Handles the first start and moves to the running state.
    pub async fn start(mut self) -> PanelController<Running> {
        info!("Starting panel controller in mode {}", self.mode);

        if self.settings.apply_first_run() {
            if let Some(path) = self.settings_path.clone() {
                if let Err(e) = self.settings.save(&path).await {
                    error!("Failed to save first-run settings: {}", e);
                }
            }
            self.notify(PanelNotice::FirstRun);
        }

        self.transition()
    }
}

impl PanelController<Running> {
    /// Main loop. Runs until disposed or until every handle is gone.
    pub async fn run(mut self) -> PanelController<Stopped> {
        info!("Panel controller running");

        loop {
            tokio::select! {
                biased;

                Some(event) = self.session_events.recv() => self.on_session_event(event),
                Some(fired) = self.timer_fires.recv() => self.on_timer_fired(fired),
                Some(up) = self.reach_reports.recv() => self.on_network_changed(up),
                Some(e) = self.audit_errors.recv() => warn!("Audit failure: {}", e),

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.on_command(command).await.is_break() {
                            break;
                        }
                    }
                    None => {
                        info!("All panel handles dropped");
                        break;
                    }
                },
            }
        }

        info!("Transitioning to Stopped state");
        self.transition()
    }

    async fn on_command(&mut self, command: PanelCommand) -> ControlFlow<()> {
        match command {
            PanelCommand::Publish(command, reply) => {
                let result = self.sessions.publish(command).map_err(PanelError::from);
                if let Err(e) = &result {
                    warn!("Could not send {}: {}", command, e);
                }
                let _ = reply.send(result);
            }
            PanelCommand::Reconfigure(settings, reply) => {
                let result = self.reconfigure(*settings).await;
                let _ = reply.send(result);
            }
            PanelCommand::NetworkChanged(up) => self.on_network_changed(up),
            PanelCommand::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            PanelCommand::Suspend => self.suspend(),
            PanelCommand::UserActivity => self.apply(Action::AwakenDevice),
            PanelCommand::VerifyCode(code, reply) => {
                let _ = reply.send(self.settings.verify_code(&code));
            }
            PanelCommand::Dispose(reply) => {
                info!("Dispose requested");
                self.dispose_reply = Some(reply);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn reconfigure(&mut self, settings: Settings) -> Result<InitOutcome, PanelError> {
        settings
            .validate()
            .map_err(|e| PanelError::InvalidSettings(e.to_string()))?;
        let outcome = self.sessions.initialize(settings.to_session_config())?;
        let address_changed = settings.to_session_config().address()
            != self.settings.to_session_config().address()
            || settings.network != self.settings.network;
        self.settings = settings;

        if let Some(path) = self.settings_path.clone() {
            if let Err(e) = self.settings.save(&path).await {
                error!("Failed to save settings: {}", e);
                self.notify(PanelNotice::Error(format!("Settings not saved: {}", e)));
            }
        }
        if address_changed && self.reachability.is_some() {
            self.start_reachability_check();
        }

        Ok(outcome)
    }

    fn resume(&mut self) -> Result<InitOutcome, PanelError> {
        info!("Resuming panel");
        self.connectivity.attach();
        self.start_reachability_check();

        let outcome = match self.sessions.initialize(self.settings.to_session_config())? {
            InitOutcome::Unchanged => self.sessions.reconnect()?,
            outcome => outcome,
        };
        self.apply(Action::ResetInactivityTimer);
        Ok(outcome)
    }

    fn suspend(&mut self) {
        info!("Suspending panel");
        self.connectivity.detach();
        self.stop_reachability_check();
    }

    fn start_reachability_check(&mut self) {
        self.stop_reachability_check();

        let network = &self.settings.network;
        if network.check_interval_secs == 0 {
            debug!("Reachability check disabled");
            return;
        }

        let token = CancellationToken::new();
        let handle = spawn_reachability_check(
            self.settings.to_session_config().address(),
            Duration::from_secs(network.check_interval_secs),
            Duration::from_millis(network.check_timeout_ms),
            self.reach_tx.clone(),
            token.clone(),
        );
        self.reachability = Some(ReachabilityCheck { token, handle });
    }

    fn on_network_changed(&mut self, up: bool) {
        match self.connectivity.on_network_changed(up) {
            Some(ConnectivityEvent::Connected) => match self.sessions.reconnect() {
                Ok(outcome) => debug!("Network back, session {:?}", outcome),
                Err(e) => warn!("Network back but no session to restore: {}", e),
            },
            Some(ConnectivityEvent::Disconnected) => {
                warn!("Network lost, waiting for it to come back");
            }
            None => {}
        }
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let Some(delivery) = self.sessions.accept(event) else {
            return;
        };

        match delivery {
            Delivery::Connected => self.notify(PanelNotice::Connected),
            Delivery::Disconnected => {
                let topic = self
                    .sessions
                    .config()
                    .map(|config| config.state_topic.clone())
                    .unwrap_or_default();
                let marker = InboundMessage::new(
                    topic,
                    ERROR_SENTINEL,
                    self.sessions.generation().to_string(),
                );
                self.audit.record(&marker);
                self.notify(PanelNotice::Disconnected);
            }
            Delivery::Error(message) => {
                error!("Broker error: {}", message);
                self.notify(PanelNotice::Error(message));
            }
            Delivery::GaveUp(failures) => {
                self.notify(PanelNotice::Error(format!(
                    "Broker unreachable after {} attempts",
                    failures
                )));
            }
            Delivery::Alarm(payload, message) => {
                self.audit.record(&message);
                self.notify(PanelNotice::from(&message));
                self.on_alarm_payload(payload);
            }
            Delivery::Unrecognized(message) => {
                self.audit.record(&message);
            }
        }
    }

    fn on_alarm_payload(&mut self, payload: AlarmPayload) {
        let step = transition(self.mode, payload, self.settings.alarm.pending_time);
        if step.next != self.mode {
            info!("Alarm mode {} -> {} on {}", self.mode, step.next, payload);
        }
        self.mode = step.next;

        for action in step.actions {
            self.apply(action);
        }
    }

    fn on_timer_fired(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            return;
        }

        match fired.purpose {
            TimerPurpose::Inactivity => self.apply(Action::ActivateScreenSaver),
            TimerPurpose::Pending => {
                info!("Pending countdown expired in mode {}", self.mode);
                self.apply(Action::PendingCountdownExpired);
                self.apply(Action::HideDisableDialog);
            }
        }
    }

    /// Runs the controller-side effect of an action and hands it on to the
    /// presentation layer.
    fn apply(&mut self, action: Action) {
        match action {
            Action::AwakenDevice | Action::ResetInactivityTimer => {
                let timeout = self.settings.inactivity_timeout();
                if timeout.is_zero() {
                    self.timers.cancel(TimerPurpose::Inactivity);
                } else {
                    self.timers.schedule(TimerPurpose::Inactivity, timeout);
                }
            }
            Action::ShowDisableDialog(secs) => {
                self.timers
                    .schedule(TimerPurpose::Pending, Duration::from_secs(u64::from(secs)));
            }
            Action::HideDisableDialog => {
                self.timers.cancel(TimerPurpose::Pending);
            }
            Action::PersistMode(mode) => {
                if let Err(e) = self.store.set(mode) {
                    error!("Failed to persist alarm mode {}: {}", mode, e);
                    self.notify(PanelNotice::Error(e.to_string()));
                }
            }
            _ => {}
        }

        self.forward(action);
    }
}

impl PanelController<Stopped> {
    /// Releases everything the controller holds.
    pub fn shutdown(mut self) {
        info!("Shutting down panel controller");

        self.audit.shutdown();
        self.stop_reachability_check();
        self.timers.cancel_all();
        self.sessions.close();

        if let Some(reply) = self.dispose_reply.take() {
            let _ = reply.send(());
        }
        info!("Panel controller stopped in mode {}", self.mode);
    }
}
