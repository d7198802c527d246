use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error sentinel published on the state topic when the broker side reports a fault.
/// The same token is used for the audit record written when the session drops.
pub const ERROR_SENTINEL: &str = "ERROR";

/// A message received on (or synthesized for) the state topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
    pub id: String,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>, id: impl Into<String>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            id: id.into(),
            received_at: Local::now(),
        }
    }

    /// Decodes a raw broker payload. Invalid UTF-8 is replaced rather than rejected,
    /// the message is still audited.
    pub fn from_bytes(topic: &str, payload: &[u8], pkid: u16) -> Self {
        Self::new(topic, String::from_utf8_lossy(payload), pkid.to_string())
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n{}", self.received_at, self.topic, self.payload)
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(32).collect();
        write!(f, "{} - {} [{}]", self.received_at.format("%H:%M:%S"), preview, self.id)
    }
}

/// Whitelisted state payloads. Anything else is audited but never reaches the
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmPayload {
    Disarmed,
    ArmedHome,
    ArmedAway,
    Pending,
    Triggered,
    Error,
}

impl AlarmPayload {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload.trim() {
            "disarmed" => Some(AlarmPayload::Disarmed),
            "armed_home" => Some(AlarmPayload::ArmedHome),
            "armed_away" => Some(AlarmPayload::ArmedAway),
            "pending" => Some(AlarmPayload::Pending),
            "triggered" => Some(AlarmPayload::Triggered),
            ERROR_SENTINEL => Some(AlarmPayload::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmPayload::Disarmed => "disarmed",
            AlarmPayload::ArmedHome => "armed_home",
            AlarmPayload::ArmedAway => "armed_away",
            AlarmPayload::Pending => "pending",
            AlarmPayload::Triggered => "triggered",
            AlarmPayload::Error => ERROR_SENTINEL,
        }
    }
}

impl fmt::Display for AlarmPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commands published on the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmCommand {
    ArmHome,
    ArmAway,
    Disarm,
}

impl AlarmCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmCommand::ArmHome => "ARM_HOME",
            AlarmCommand::ArmAway => "ARM_AWAY",
            AlarmCommand::Disarm => "DISARM",
        }
    }
}

impl fmt::Display for AlarmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
