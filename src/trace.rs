use std::{
    fs,
    io::{self, BufRead, BufReader, Read},
    path::PathBuf,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{Receiver, Sender};
use log::info;
use xz2::read::XzDecoder;

use crate::{
    error::TraceError,
    protocol::{MemoryRequest, Operation, ProcessorId},
};

/// Parses one trace line: `<proc> <op> <addr> [data]`. Blank lines and `#`
/// comments yield `None`.
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<MemoryRequest>, TraceError> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parse_err = |reason: String| TraceError::Parse {
        line: line_no,
        reason,
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (processor, op, rest) = match fields.as_slice() {
        [processor, op, rest @ ..] => (processor, op, rest),
        _ => return Err(parse_err(format!("expected `<proc> <op> ...`, got `{line}`"))),
    };
    let processor: ProcessorId = processor
        .parse()
        .map_err(|_| parse_err(format!("bad processor `{processor}`")))?;
    let op: Operation = op.parse().map_err(parse_err)?;
    let number = |s: &str| {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).map(|v| v as i32),
            None => s.parse::<i32>(),
        };
        parsed.map_err(|_| parse_err(format!("bad number `{s}`")))
    };

    let (address, data) = match (op, rest) {
        (Operation::TxBegin | Operation::TxEnd, &[]) => (0, 0),
        (Operation::TxBegin | Operation::TxEnd, &[address]) => (number(address)?, 0),
        (Operation::Load, &[address]) => (number(address)?, 0),
        (Operation::Store, &[address, data]) => (number(address)?, number(data)?),
        _ => {
            return Err(parse_err(format!(
                "wrong number of operands for {op}: `{line}`"
            )))
        }
    };
    Ok(Some(MemoryRequest {
        address,
        processor,
        op,
        data,
    }))
}

/// Requests streamed from a trace file by a background reader.
pub struct Trace {
    pub rec: Receiver<Result<Vec<MemoryRequest>, TraceError>>,
    _thread: JoinHandle<()>,
}

impl Trace {
    /// Opens `path`, transparently decompressing `.xz` files.
    pub fn read(path: PathBuf, req_per_block: usize, blocks_per_queue: usize) -> io::Result<Trace> {
        let file = fs::File::open(&path)?;
        let stream: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "xz") {
            Box::new(XzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(Trace::from_reader(stream, req_per_block, blocks_per_queue))
    }

    pub fn from_reader(
        stream: Box<dyn Read + Send>,
        req_per_block: usize,
        blocks_per_queue: usize,
    ) -> Trace {
        let (sender, receiver) = crossbeam::channel::bounded(blocks_per_queue);
        let t = thread::spawn(move || Trace::run_thread(stream, req_per_block.max(1), sender));
        Trace {
            rec: receiver,
            _thread: t,
        }
    }

    fn run_thread(
        stream: Box<dyn Read + Send>,
        req_per_block: usize,
        queue: Sender<Result<Vec<MemoryRequest>, TraceError>>,
    ) {
        let mut block = Vec::with_capacity(req_per_block);
        let mut total = 0;
        for (idx, line) in BufReader::new(stream).lines().enumerate() {
            let parsed = line
                .map_err(TraceError::from)
                .and_then(|line| parse_line(idx + 1, &line));
            match parsed {
                Ok(Some(request)) => {
                    block.push(request);
                    total += 1;
                    if block.len() == req_per_block {
                        let full = std::mem::replace(&mut block, Vec::with_capacity(req_per_block));
                        if queue.send(Ok(full)).is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = queue.send(Err(err));
                    return;
                }
            }
        }
        if !block.is_empty() {
            let _ = queue.send(Ok(block));
        }
        info!("trace: read {total} requests");
    }
}
