use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::{CoherenceKind, LineState, ProcessorId, ResponseCode};

/// Faults a controller cannot recover from. Any of these halts the worker
/// that raised it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A refill must resolve or abort; NACK leaves it undecided.
    #[error("processor {processor}: {kind} refill answered with NACK")]
    RefillNack {
        processor: ProcessorId,
        kind: CoherenceKind,
    },
    #[error("processor {processor}: unexpected {code} in reply to {kind}")]
    UnexpectedResponse {
        processor: ProcessorId,
        kind: CoherenceKind,
        code: ResponseCode,
    },
    #[error("processor {processor}: {kind} granted line state {state}")]
    InvalidGrant {
        processor: ProcessorId,
        kind: CoherenceKind,
        state: LineState,
    },
    #[error("processor {processor}: {kind} grant carried {got} words, line holds {expected}")]
    MalformedBlock {
        processor: ProcessorId,
        kind: CoherenceKind,
        got: usize,
        expected: usize,
    },
    /// The copy fetched after a stale upgrade went stale as well.
    #[error("processor {processor}: upgrade of {address:#x} lost twice")]
    UpgradeLost {
        processor: ProcessorId,
        address: i32,
    },
    #[error("request for processor {request} delivered to controller {controller}")]
    Misrouted {
        controller: ProcessorId,
        request: ProcessorId,
    },
    #[error("processor {processor}: coordinator disconnected")]
    CoordinatorGone { processor: ProcessorId },
    #[error("processor {processor}: no {kind} response within {timeout:?}")]
    Timeout {
        processor: ProcessorId,
        kind: CoherenceKind,
        timeout: Duration,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },
    #[error("block size {0} is smaller than one 4-byte word")]
    BlockTooSmall(usize),
    #[error("processor count {0} outside 1..={max}", max = crate::config::MAX_PROCESSORS)]
    ProcessorCount(usize),
    #[error("block_size and lines together need {0} address bits, more than 32")]
    AddressWidth(u32),
    #[error("queue depth must be at least 1")]
    QueueDepth,
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("trace request {index}: processor {processor} is not configured")]
    UnknownProcessor { index: u64, processor: ProcessorId },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level error for driving a set of controllers.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("controller {0} halted before accepting all requests")]
    ControllerHalted(ProcessorId),
    #[error("{0} thread panicked")]
    WorkerPanicked(String),
    #[error("bad arguments: {0}")]
    Args(#[from] pico_args::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
