//! Panel controller subsystem
//!
//! 1. [`panel_controller`] - Single task that owns mode, session, timers and connectivity
//! 2. [`panel_handle`] - Cloneable API for the presentation layer
//!
//! # Architecture
//!
//! ```text
//! Broker ──► SessionManager ──┐
//! Network ─► Connectivity ────┼──► PanelController ──► Actions / Notices
//! Handle ──► Commands ────────┘          │
//!                                        ├──► ModeStore
//!                                        └──► AuditRecorder
//! ```

pub mod panel_controller;
pub mod panel_handle;

pub use panel_handle::{PanelError, PanelHandle, PanelNotice, PanelOptions, PanelStreams};
