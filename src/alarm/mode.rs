use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current mode of the alarm panel.
///
/// The pending variants carry the armed mode they were entered from, so a
/// later disarm or countdown expiry can tell the "home" flow from the "away"
/// flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmMode {
    #[default]
    Disarmed,
    ArmedHome,
    ArmedAway,
    PendingHome,
    PendingAway,
    Triggered,
    Error,
}

impl AlarmMode {
    pub const ALL: [AlarmMode; 7] = [
        AlarmMode::Disarmed,
        AlarmMode::ArmedHome,
        AlarmMode::ArmedAway,
        AlarmMode::PendingHome,
        AlarmMode::PendingAway,
        AlarmMode::Triggered,
        AlarmMode::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmMode::Disarmed => "disarmed",
            AlarmMode::ArmedHome => "armed_home",
            AlarmMode::ArmedAway => "armed_away",
            AlarmMode::PendingHome => "pending_home",
            AlarmMode::PendingAway => "pending_away",
            AlarmMode::Triggered => "triggered",
            AlarmMode::Error => "error",
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, AlarmMode::ArmedHome | AlarmMode::ArmedAway)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AlarmMode::PendingHome | AlarmMode::PendingAway)
    }

    /// Pending mode that follows this armed mode, if any.
    pub fn pending_variant(&self) -> Option<AlarmMode> {
        match self {
            AlarmMode::ArmedHome => Some(AlarmMode::PendingHome),
            AlarmMode::ArmedAway => Some(AlarmMode::PendingAway),
            _ => None,
        }
    }

    /// Armed mode a pending mode was entered from.
    pub fn armed_origin(&self) -> Option<AlarmMode> {
        match self {
            AlarmMode::PendingHome => Some(AlarmMode::ArmedHome),
            AlarmMode::PendingAway => Some(AlarmMode::ArmedAway),
            _ => None,
        }
    }
}

impl fmt::Display for AlarmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown alarm mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for AlarmMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlarmMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s.trim())
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_display_form() {
        for mode in AlarmMode::ALL {
            assert_eq!(mode.to_string().parse::<AlarmMode>(), Ok(mode));
        }
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!("armed_night".parse::<AlarmMode>().is_err());
    }

    #[test]
    fn pending_variant_round_trips_to_origin() {
        assert_eq!(
            AlarmMode::ArmedHome.pending_variant().and_then(|m| m.armed_origin()),
            Some(AlarmMode::ArmedHome)
        );
        assert_eq!(AlarmMode::Triggered.pending_variant(), None);
        assert_eq!(AlarmMode::Disarmed.armed_origin(), None);
    }

    #[test]
    fn default_is_disarmed() {
        assert_eq!(AlarmMode::default(), AlarmMode::Disarmed);
    }
}
