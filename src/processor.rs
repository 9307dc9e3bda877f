use crate::protocol::ProcessorId;

/// Controller-local view of the processor it serves.
#[derive(Debug)]
pub struct Processor {
    pub id: ProcessorId,
    pub in_transaction: bool,
    pub op_idx: u64,
}

impl Processor {
    pub fn new(id: ProcessorId) -> Self {
        Processor {
            id,
            in_transaction: false,
            op_idx: 0,
        }
    }
}
