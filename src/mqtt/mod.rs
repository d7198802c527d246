//! # MQTT Integration Module
//!
//! Connects the panel to the home-automation broker. The broker publishes the
//! authoritative alarm state on the state topic and receives arm/disarm
//! commands on the command topic.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker connection settings and validation
//! ├── message_manager.rs  - Inbound messages, state payloads, outbound commands
//! ├── mqtt_handler.rs     - Session lifecycle, generations, rumqttc event loop
//! └── reconnect.rs        - Retry policies for lost connections
//! ```
//!
//! ## Session Generations
//!
//! Every teardown bumps a generation counter before the connection is released.
//! Events carry the generation of the session that produced them, so anything a
//! dead session still manages to deliver is dropped on arrival instead of being
//! applied to its replacement.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod reconnect;

pub use config::{ConfigProblem, SessionConfig};
pub use message_manager::{AlarmCommand, AlarmPayload, InboundMessage, ERROR_SENTINEL};
pub use mqtt_handler::{
    BrokerLink, Connector, Delivery, InitOutcome, RumqttConnector, SessionError, SessionEvent,
    SessionEventKind, SessionManager, SessionState,
};
pub use reconnect::{ExponentialBackoff, NoRetry, ReconnectPolicy};
