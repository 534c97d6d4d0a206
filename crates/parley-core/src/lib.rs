pub mod envelope;
pub mod errors;
pub mod ids;
pub mod message_log;

pub use envelope::{now_timestamp, Envelope, LogEntry, SERVER_SENDER};
pub use errors::EnvelopeError;
pub use ids::SessionId;
pub use message_log::{MessageLog, DEFAULT_LOG_CAPACITY};
