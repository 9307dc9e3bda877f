//! Private-cache controller for a directory-based MSI protocol with
//! transactional begin/end and abort-on-conflict.
//!
//! Each processor owns a [`CacheLookupEngine`] running on its own
//! [`RequestSequencer`] thread. Engines reach shared state only through a
//! [`CoherencePort`], normally a [`CoherenceClient`] wired to an external
//! coordinator by [`coherence::fabric`].

pub mod cache;
pub mod coherence;
pub mod config;
pub mod engine;
pub mod error;
pub mod harness;
pub mod processor;
pub mod protocol;
pub mod sequencer;
pub mod trace;

pub use cache::{CacheLine, CacheLineStore, LineAddr};
pub use coherence::{CoherenceClient, CoherencePort, CoordinatorLink};
pub use config::{Config, Geometry};
pub use engine::{CacheLookupEngine, ControllerStats};
pub use error::{Error, ProtocolError};
pub use protocol::{
    CoherenceKind, CoherenceMessage, CoherenceResponse, Completion, LineState, MemoryRequest,
    Operation, Outcome, ResponseCode,
};
pub use sequencer::{RequestSequencer, Response};
