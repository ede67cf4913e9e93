//! Party Orchestration Layer
//!
//! The per-node machinery that drives multi-round protocol sessions: the
//! black-box Party contract, the deterministic in-process implementation,
//! wire encodings, and the session multiplexer.

pub mod convert;
pub mod local;
pub mod manager;
pub mod traits;

pub use convert::ThresholdSignature;
pub use local::LocalPartyFactory;
pub use manager::{KeygenLaunch, MessageRouter, PartyManager, SigningLaunch};
pub use traits::{
    KeygenOutput, KeygenParams, Party, PartyError, PartyFactory, PartyMessage, PublicKeyPoint,
    SigningOutput, SigningParams,
};
