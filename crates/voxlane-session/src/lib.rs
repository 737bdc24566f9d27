//! Voice session orchestration: connection lifecycle, barge-in, local
//! synthesis of text-only responses, and degraded-network handling.

pub mod connection;
pub mod events;
pub mod handle;
mod machine;
pub mod reconnect;
pub mod speech;
pub mod state;

pub use connection::{Connector, Link, LinkEvent, ServerHello, WsConnector};
pub use events::{SessionEvent, SessionSnapshot};
pub use handle::{SessionBuilder, SessionHandle};
pub use reconnect::{Backoff, connect_with_timeout, reconnect_with_backoff};
pub use state::{DetectionMode, SessionState, VoiceSession};
