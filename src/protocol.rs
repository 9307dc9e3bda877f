//! Messages exchanged between the ingress producer, a controller and the
//! coordinator.

use std::{fmt, str::FromStr};

pub type ProcessorId = u32;

/// MSI state of a private cache line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LineState {
    Modified,
    Shared,
    #[default]
    Invalid,
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LineState::Modified => "M",
            LineState::Shared => "S",
            LineState::Invalid => "I",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Load,
    Store,
    TxBegin,
    TxEnd,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Load => "LOAD",
            Operation::Store => "STORE",
            Operation::TxBegin => "TX_BEGIN",
            Operation::TxEnd => "TX_END",
        })
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOAD" | "LD" => Ok(Operation::Load),
            "STORE" | "ST" => Ok(Operation::Store),
            "TX_BEGIN" => Ok(Operation::TxBegin),
            "TX_END" => Ok(Operation::TxEnd),
            _ => Err(format!("unknown operation `{s}`")),
        }
    }
}

/// One memory operation from a processor. Consumed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequest {
    pub address: i32,
    pub processor: ProcessorId,
    pub op: Operation,
    /// Store payload, ignored by every other operation.
    pub data: i32,
}

impl MemoryRequest {
    pub fn load(processor: ProcessorId, address: i32) -> Self {
        MemoryRequest {
            address,
            processor,
            op: Operation::Load,
            data: 0,
        }
    }

    pub fn store(processor: ProcessorId, address: i32, data: i32) -> Self {
        MemoryRequest {
            address,
            processor,
            op: Operation::Store,
            data,
        }
    }

    pub fn tx_begin(processor: ProcessorId) -> Self {
        MemoryRequest {
            address: 0,
            processor,
            op: Operation::TxBegin,
            data: 0,
        }
    }

    pub fn tx_end(processor: ProcessorId) -> Self {
        MemoryRequest {
            address: 0,
            processor,
            op: Operation::TxEnd,
            data: 0,
        }
    }
}

impl fmt::Display for MemoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemReq {{ addr: {:#x}, proc: {}, op: {}, data: {} }}",
            self.address, self.processor, self.op, self.data
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherenceKind {
    LdMiss,
    SdMiss,
    SdHit,
    TxBegin,
    TxEnd,
}

impl CoherenceKind {
    /// Line state a grant confers when the coordinator does not name one.
    pub fn default_grant(self) -> LineState {
        match self {
            CoherenceKind::LdMiss => LineState::Shared,
            _ => LineState::Modified,
        }
    }
}

impl fmt::Display for CoherenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CoherenceKind::LdMiss => "LD_MISS",
            CoherenceKind::SdMiss => "SD_MISS",
            CoherenceKind::SdHit => "SD_HIT",
            CoherenceKind::TxBegin => "TX_BEGIN",
            CoherenceKind::TxEnd => "TX_END",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherenceMessage {
    pub kind: CoherenceKind,
    pub address: i32,
    pub processor: ProcessorId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Nack,
    Ack,
    TxAbort,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseCode::Nack => "NACK",
            ResponseCode::Ack => "ACK",
            ResponseCode::TxAbort => "TX_ABORT",
        })
    }
}

/// Exactly one of these answers every [`CoherenceMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoherenceResponse {
    pub code: ResponseCode,
    /// Line contents, present on refill grants.
    pub block: Option<Vec<i32>>,
    /// State the coordinator grants on a refill. `None` means the kind's
    /// default (S for LD_MISS, M for SD_MISS).
    pub grant: Option<LineState>,
}

impl CoherenceResponse {
    pub fn ack() -> Self {
        CoherenceResponse {
            code: ResponseCode::Ack,
            block: None,
            grant: None,
        }
    }

    pub fn nack() -> Self {
        CoherenceResponse {
            code: ResponseCode::Nack,
            block: None,
            grant: None,
        }
    }

    pub fn abort() -> Self {
        CoherenceResponse {
            code: ResponseCode::TxAbort,
            block: None,
            grant: None,
        }
    }

    pub fn grant(state: LineState, block: Vec<i32>) -> Self {
        CoherenceResponse {
            code: ResponseCode::Ack,
            block: Some(block),
            grant: Some(state),
        }
    }
}

/// Asynchronous notice from the coordinator that a line must be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invalidate {
    pub block_index: usize,
}

/// Terminal answer to a [`MemoryRequest`]. NACK never leaves a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    TxAbort,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Ack => "ACK",
            Outcome::TxAbort => "TX_ABORT",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub outcome: Outcome,
    /// Word read by a LOAD that completed with ACK.
    pub value: Option<i32>,
}

impl Completion {
    pub fn ack() -> Self {
        Completion {
            outcome: Outcome::Ack,
            value: None,
        }
    }

    pub fn loaded(value: i32) -> Self {
        Completion {
            outcome: Outcome::Ack,
            value: Some(value),
        }
    }

    pub fn aborted() -> Self {
        Completion {
            outcome: Outcome::TxAbort,
            value: None,
        }
    }
}
