//! PeerLink session protocol engine.
//! Host-driven: no I/O, no threads; the host lends a transport to
//! `Engine::service` and drains resulting events.

pub mod caps;
pub mod config;
pub mod direct;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod peer;
pub mod queue;
pub mod transport;
pub mod wire;

mod discovery;

pub use caps::Capabilities;
pub use config::Config;
pub use engine::{Engine, Event, SendOptions};
pub use error::{Error, Result};
pub use peer::{GlobalStats, PeerId, PeerState, PeerStats};
pub use queue::{PressureLevel, Priority};
pub use transport::{StreamId, Transport};
pub use wire::PROTOCOL_VERSION;
