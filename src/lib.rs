//! Control core of a wall-mounted MQTT alarm panel.
//!
//! The broker owns the alarm; the panel mirrors its state, prompts for the
//! disarm code while pending and publishes arm/disarm commands.

pub mod alarm;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod mqtt;
pub mod persistence;

pub use alarm::{Action, AlarmMode};
pub use config::Settings;
pub use controller::{PanelError, PanelHandle, PanelNotice, PanelOptions, PanelStreams};
