//! # Alarm Logic
//!
//! Mode model, the pure transition table and the timers the transitions depend on.
//!
//! ```text
//! alarm/
//! ├── mode.rs           - AlarmMode and its persisted string form
//! ├── state_machine.rs  - (mode, payload) -> (next mode, actions)
//! └── timer.rs          - pending countdown and inactivity timers
//! ```

pub mod mode;
pub mod state_machine;
pub mod timer;

pub use mode::AlarmMode;
pub use state_machine::{transition, Action, Transition};
pub use timer::{TimerFired, TimerPurpose, TimerScheduler};
