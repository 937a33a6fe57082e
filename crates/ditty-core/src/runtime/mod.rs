//! Ditty runtime - runs a compiled score.
//!
//! The runtime manages:
//! - One generator task per loop and per shared filter
//! - The render callback pulled by the audio host
//! - The session that wires them together and reacts to their events

pub mod generator;
pub mod host;
pub mod render;
pub mod session;

pub use generator::GeneratorHandle;
pub use host::{AudioHost, OfflineHost};
pub use render::{MeterBank, RenderCallback, RenderOutcome};
pub use session::{Session, SessionEvent};
