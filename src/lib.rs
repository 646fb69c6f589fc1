//! Realtime call audio streaming engine.
//!
//! Bridges a telephony call with a remote consumer over a bidirectional
//! secure WebSocket: captured 20 ms frames are buffered, paced, and sent
//! as JSON media messages; JSON control messages flow back and returned
//! audio is mixed into the outgoing call leg with checkpoint-driven
//! progress events.

pub mod buffer;
pub mod codec;
pub mod command;
pub mod config;
pub mod errors;
pub mod events;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod transport;

// Re-export commonly used items for convenience
pub use command::CommandSurface;
pub use config::EngineConfig;
pub use errors::{StreamError, StreamResult};
pub use events::{EventKind, EventSink, StreamEvent};
pub use session::{CaptureDirection, Direction, StreamSettings};
pub use supervisor::{StartParams, Supervisor};
