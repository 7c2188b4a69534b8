mod error;

pub mod capture;
pub mod protocol;
pub mod session;
pub mod transcript;
pub mod transport;
pub mod ws;

pub use error::{DictationError, Result};
pub use session::{DictationSession, SessionEvent, SessionState};
pub use transport::{ChunkSender, Connector, TransportHandle};
pub use ws::WsConnector;
