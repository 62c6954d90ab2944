//! Streaming channel client
//!
//! [`StreamSession`] owns one persistent connection and turns wire frames into
//! epoch-stamped [`SessionEvent`]s. Connections are opened through the
//! [`Connector`] seam; [`WsConnector`] is the WebSocket implementation.

mod session;
mod transport;

pub use session::{SessionEvent, SessionState, StreamSession};
pub use transport::{Connection, Connector, Frame, WsConnector};

#[cfg(test)]
pub(crate) use session::tests::{Script, ScriptedConnector};
