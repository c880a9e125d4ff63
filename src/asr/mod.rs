//! Streaming speech recognition client
//!
//! - `protocol`: JSON envelopes and server events
//! - `transport`: socket abstraction and the WebSocket implementation
//! - `session`: the per-attempt state machine

pub mod protocol;
pub mod session;
pub mod transport;

pub use protocol::{Inbound, ServerEvent, Task, parse_server_message};
pub use session::{
    Command, SessionContext, SessionState, Settlement, Status, StatusCallback, Transcript, run,
};
pub use transport::{Connector, Incoming, Transport, WsConnector, WsTransport, socket_url};
