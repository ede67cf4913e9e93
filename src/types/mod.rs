//! Shared Data Types

pub mod key;
pub mod message;
pub mod session;

pub use key::{Algorithm, Curve, KeyMetadata, KeyStatus, PENDING_PUBLIC_KEY};
pub use message::{IncomingMessage, NodeInfo, NodeStatus, RoundProgress, WalRecord};
pub use session::{Session, SessionKind, SessionProtocol, SessionStatus};
