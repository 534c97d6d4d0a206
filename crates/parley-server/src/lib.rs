//! WebSocket chat server: accepts clients, tracks their sessions, relays
//! messages between them, and reaps connections that go quiet.
//!
//! [`start`] binds the listener and returns a [`ServerHandle`] through which
//! the operator broadcasts, sends private messages and reads metrics.

pub mod acceptor;
pub mod dispatch;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session;

pub use dispatch::Dispatcher;
pub use error::{DispatchError, ServerError, SessionError};
pub use registry::SessionRegistry;
pub use server::{start, ServerConfig, ServerHandle};
pub use session::{Session, SessionState};
