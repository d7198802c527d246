//! Alarm mode transitions.
//!
//! `transition` is a pure function of the current mode, the validated payload
//! and the configured pending delay. It never performs side effects; instead it
//! returns the ordered list of [`Action`]s a presentation layer and the panel
//! controller interpret.
//!
//! ```text
//!               armed_home / armed_away
//!   Disarmed ───────────────────────────► ArmedHome | ArmedAway
//!      ▲                                         │
//!      │ disarmed (from any mode)                │ pending
//!      │                                         ▼
//!      └──────────── Triggered ◄──────── PendingHome | PendingAway
//!                              triggered
//! ```

use super::mode::AlarmMode;
use crate::mqtt::message_manager::AlarmPayload;

/// Side effect requested by a transition or a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wake the screen and leave the screensaver.
    AwakenDevice,
    ResetInactivityTimer,
    HideDisableDialog,
    HideTriggeredView,
    HideAnyDialog,
    HideProgress,
    /// Show the disarm prompt with the given countdown in seconds.
    ShowDisableDialog(u32),
    ShowTriggeredView,
    PersistMode(AlarmMode),
    /// The inactivity timer fired.
    ActivateScreenSaver,
    /// The pending countdown ran out before a disarm arrived.
    PendingCountdownExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: AlarmMode,
    pub actions: Vec<Action>,
}

impl Transition {
    fn new(next: AlarmMode, mut actions: Vec<Action>) -> Self {
        actions.push(Action::PersistMode(next));
        Self { next, actions }
    }

    fn unchanged(current: AlarmMode) -> Self {
        Self {
            next: current,
            actions: Vec::new(),
        }
    }

    pub fn shows_disable_dialog(&self) -> Option<u32> {
        self.actions.iter().find_map(|action| match action {
            Action::ShowDisableDialog(secs) => Some(*secs),
            _ => None,
        })
    }
}

pub fn transition(current: AlarmMode, payload: AlarmPayload, pending_delay_secs: u32) -> Transition {
    use Action::*;

    match payload {
        AlarmPayload::Disarmed => Transition::new(
            AlarmMode::Disarmed,
            vec![AwakenDevice, ResetInactivityTimer, HideDisableDialog, HideTriggeredView],
        ),
        AlarmPayload::ArmedHome => Transition::new(
            AlarmMode::ArmedHome,
            vec![HideDisableDialog, ResetInactivityTimer, HideAnyDialog],
        ),
        AlarmPayload::ArmedAway => Transition::new(
            AlarmMode::ArmedAway,
            vec![HideDisableDialog, ResetInactivityTimer, HideAnyDialog],
        ),
        AlarmPayload::Pending => match current.pending_variant() {
            Some(pending) => {
                let mut actions = vec![HideAnyDialog, HideProgress, AwakenDevice];
                if pending_delay_secs > 0 {
                    actions.push(ShowDisableDialog(pending_delay_secs));
                }
                Transition::new(pending, actions)
            }
            None => Transition::new(current, vec![AwakenDevice]),
        },
        AlarmPayload::Triggered => Transition::new(
            AlarmMode::Triggered,
            vec![HideAnyDialog, HideDisableDialog, HideProgress, AwakenDevice, ShowTriggeredView],
        ),
        AlarmPayload::Error => Transition::unchanged(current),
    }
}
