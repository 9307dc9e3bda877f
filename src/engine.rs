use log::{debug, trace, warn};
use serde::Serialize;

use crate::{
    cache::{CacheLineStore, LineAddr},
    coherence::CoherencePort,
    config::Geometry,
    error::ProtocolError,
    processor::Processor,
    protocol::{
        CoherenceKind, CoherenceMessage, CoherenceResponse, Completion, LineState, MemoryRequest,
        Operation, Outcome, ProcessorId, ResponseCode,
    },
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStats {
    pub read_hits: u64,
    pub write_hits: u64,
    pub upgrades: u64,
    pub load_misses: u64,
    pub store_misses: u64,
    pub aborts: u64,
    pub messages: u64,
    pub invalidations: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    processor: ProcessorId,
    operations: u64,
    read_hits: u64,
    write_hits: u64,
    upgrades: u64,
    load_misses: u64,
    store_misses: u64,
    aborts: u64,
    messages: u64,
    invalidations: u64,
    miss_rate: f64,
}

enum Refill {
    Installed,
    Aborted,
}

enum Upgrade {
    Granted,
    Aborted,
    /// The shared copy went away before the upgrade resolved.
    Stale,
}

/// Per-processor protocol core. Decides, for each request, whether the
/// private store can satisfy it and drives the coordinator when it can't.
#[derive(Debug)]
pub struct CacheLookupEngine<P: CoherencePort> {
    processor: Processor,
    store: CacheLineStore,
    port: P,
    stats: ControllerStats,
}

impl<P: CoherencePort> CacheLookupEngine<P> {
    pub fn new(id: ProcessorId, geometry: Geometry, port: P) -> Self {
        CacheLookupEngine {
            processor: Processor::new(id),
            store: CacheLineStore::new(geometry),
            port,
            stats: ControllerStats::default(),
        }
    }

    pub fn id(&self) -> ProcessorId {
        self.processor.id
    }

    pub fn in_transaction(&self) -> bool {
        self.processor.in_transaction
    }

    pub fn store(&self) -> &CacheLineStore {
        &self.store
    }

    /// Direct access for preloading lines or applying inbound events.
    pub fn store_mut(&mut self) -> &mut CacheLineStore {
        &mut self.store
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn make_stats(&self) -> StatsReport {
        let s = self.stats;
        let misses = s.load_misses + s.store_misses;
        let accesses = misses + s.read_hits + s.write_hits + s.upgrades;
        StatsReport {
            processor: self.processor.id,
            operations: self.processor.op_idx,
            read_hits: s.read_hits,
            write_hits: s.write_hits,
            upgrades: s.upgrades,
            load_misses: s.load_misses,
            store_misses: s.store_misses,
            aborts: s.aborts,
            messages: s.messages,
            invalidations: s.invalidations,
            miss_rate: if accesses == 0 {
                0.0
            } else {
                misses as f64 / accesses as f64
            },
        }
    }

    /// Applies invalidates queued while no request was in flight.
    pub fn sync_invalidations(&mut self) {
        let applied = self.port.drain_invalidations(&mut self.store);
        self.stats.invalidations += applied as u64;
    }

    /// Runs one request to its terminal outcome.
    pub fn lookup(&mut self, req: &MemoryRequest) -> Result<Completion, ProtocolError> {
        if req.processor != self.processor.id {
            return Err(ProtocolError::Misrouted {
                controller: self.processor.id,
                request: req.processor,
            });
        }
        let addr = self.store.split_addr(req.address);
        trace!(
            "proc {}: lookup {req} hit: {}",
            self.processor.id,
            self.store.hit(addr.index, addr.tag)
        );

        let completion = match req.op {
            Operation::TxBegin => self.tx_begin(req)?,
            Operation::TxEnd => self.tx_end(req)?,
            Operation::Load => self.load(req, addr)?,
            Operation::Store => self.store_word(req, addr)?,
        };

        self.processor.op_idx += 1;
        if completion.outcome == Outcome::TxAbort {
            self.stats.aborts += 1;
            self.end_transaction();
            warn!("proc {}: {} aborted", self.processor.id, req.op);
        }
        Ok(completion)
    }

    fn exchange(
        &mut self,
        kind: CoherenceKind,
        address: i32,
    ) -> Result<CoherenceResponse, ProtocolError> {
        self.stats.messages += 1;
        let msg = CoherenceMessage {
            kind,
            address,
            processor: self.processor.id,
        };
        self.port.exchange(msg, &mut self.store)
    }

    fn unexpected(&self, kind: CoherenceKind, code: ResponseCode) -> ProtocolError {
        ProtocolError::UnexpectedResponse {
            processor: self.processor.id,
            kind,
            code,
        }
    }

    fn end_transaction(&mut self) {
        self.processor.in_transaction = false;
        self.store.clear_transactional();
    }

    fn touch(&mut self, index: usize) {
        if self.processor.in_transaction {
            self.store.mark_transactional(index);
        }
    }

    fn tx_begin(&mut self, req: &MemoryRequest) -> Result<Completion, ProtocolError> {
        let response = self.exchange(CoherenceKind::TxBegin, req.address)?;
        match response.code {
            ResponseCode::Ack => {
                self.processor.in_transaction = true;
                debug!("proc {}: transaction open", self.processor.id);
                Ok(Completion::ack())
            }
            code => Err(self.unexpected(CoherenceKind::TxBegin, code)),
        }
    }

    fn tx_end(&mut self, req: &MemoryRequest) -> Result<Completion, ProtocolError> {
        let response = self.exchange(CoherenceKind::TxEnd, req.address)?;
        match response.code {
            ResponseCode::Ack => {
                self.end_transaction();
                debug!("proc {}: transaction closed", self.processor.id);
                Ok(Completion::ack())
            }
            ResponseCode::TxAbort => Ok(Completion::aborted()),
            code => Err(self.unexpected(CoherenceKind::TxEnd, code)),
        }
    }

    fn load(&mut self, req: &MemoryRequest, addr: LineAddr) -> Result<Completion, ProtocolError> {
        if self.store.hit(addr.index, addr.tag) {
            self.stats.read_hits += 1;
        } else {
            self.stats.load_misses += 1;
            if let Refill::Aborted = self.refill(CoherenceKind::LdMiss, req.address, addr)? {
                return Ok(Completion::aborted());
            }
        }
        // A refill leaves the line valid; nothing can invalidate it before
        // the next exchange.
        match self.store.read(addr) {
            Some(value) => {
                self.touch(addr.index);
                debug!(
                    "proc {}: LOAD {:#x} -> {value}",
                    self.processor.id, req.address
                );
                Ok(Completion::loaded(value))
            }
            None => Err(self.unexpected(CoherenceKind::LdMiss, ResponseCode::Ack)),
        }
    }

    fn store_word(
        &mut self,
        req: &MemoryRequest,
        addr: LineAddr,
    ) -> Result<Completion, ProtocolError> {
        if self.store.hit(addr.index, addr.tag) {
            if self.store.lookup(addr.index).state == LineState::Modified {
                self.stats.write_hits += 1;
            }
        } else {
            self.stats.store_misses += 1;
            if let Refill::Aborted = self.refill(CoherenceKind::SdMiss, req.address, addr)? {
                return Ok(Completion::aborted());
            }
        }

        match self.store.lookup(addr.index).state {
            LineState::Modified => {}
            LineState::Shared => match self.upgrade(req, addr)? {
                Upgrade::Granted => {}
                Upgrade::Aborted => return Ok(Completion::aborted()),
                Upgrade::Stale => {
                    self.store.invalidate(addr.index);
                    self.stats.store_misses += 1;
                    if let Refill::Aborted =
                        self.refill(CoherenceKind::SdMiss, req.address, addr)?
                    {
                        return Ok(Completion::aborted());
                    }
                    // A refill granted S still owes one upgrade; losing
                    // that one too halts the controller.
                    if self.store.lookup(addr.index).state == LineState::Shared {
                        match self.upgrade(req, addr)? {
                            Upgrade::Granted => {}
                            Upgrade::Aborted => return Ok(Completion::aborted()),
                            Upgrade::Stale => {
                                return Err(ProtocolError::UpgradeLost {
                                    processor: self.processor.id,
                                    address: req.address,
                                })
                            }
                        }
                    }
                }
            },
            LineState::Invalid => {
                return Err(self.unexpected(CoherenceKind::SdMiss, ResponseCode::Ack))
            }
        }

        self.store.write_word(addr.index, addr.word, req.data);
        self.touch(addr.index);
        debug!(
            "proc {}: STORE {:#x} <- {}",
            self.processor.id, req.address, req.data
        );
        Ok(Completion::ack())
    }

    /// Fetches the line for `addr` and installs it in the state the
    /// coordinator grants.
    fn refill(
        &mut self,
        kind: CoherenceKind,
        address: i32,
        addr: LineAddr,
    ) -> Result<Refill, ProtocolError> {
        let processor = self.processor.id;
        let response = self.exchange(kind, address)?;
        match response.code {
            ResponseCode::Ack => {
                let state = response.grant.unwrap_or(kind.default_grant());
                if state == LineState::Invalid {
                    return Err(ProtocolError::InvalidGrant {
                        processor,
                        kind,
                        state,
                    });
                }
                let expected = self.store.words_per_line();
                let words = response.block.unwrap_or_default();
                if words.len() != expected {
                    return Err(ProtocolError::MalformedBlock {
                        processor,
                        kind,
                        got: words.len(),
                        expected,
                    });
                }
                self.store.install(addr.index, addr.tag, state, &words);
                debug!(
                    "proc {processor}: installed line {} tag {:#x} as {state}",
                    addr.index, addr.tag
                );
                Ok(Refill::Installed)
            }
            ResponseCode::TxAbort => Ok(Refill::Aborted),
            ResponseCode::Nack => Err(ProtocolError::RefillNack { processor, kind }),
        }
    }

    fn upgrade(&mut self, req: &MemoryRequest, addr: LineAddr) -> Result<Upgrade, ProtocolError> {
        self.stats.upgrades += 1;
        debug!(
            "proc {}: requesting upgrade of {:#x}",
            self.processor.id, req.address
        );
        let response = self.exchange(CoherenceKind::SdHit, req.address)?;
        let still_shared = self.store.hit(addr.index, addr.tag);
        match response.code {
            ResponseCode::Ack if still_shared => {
                self.store.set_state(addr.index, LineState::Modified);
                Ok(Upgrade::Granted)
            }
            ResponseCode::Ack | ResponseCode::Nack => {
                debug!(
                    "proc {}: upgrade of {:#x} found a stale copy, refilling",
                    self.processor.id, req.address
                );
                Ok(Upgrade::Stale)
            }
            ResponseCode::TxAbort => Ok(Upgrade::Aborted),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Answers from a fixed script and records what was sent.
    #[derive(Default)]
    struct ScriptedPort {
        replies: VecDeque<CoherenceResponse>,
        sent: Vec<CoherenceMessage>,
        /// Line indices invalidated just before the next reply is returned.
        invalidate_before_reply: Vec<usize>,
        idle_invalidations: Vec<usize>,
    }

    impl ScriptedPort {
        fn with(replies: impl IntoIterator<Item = CoherenceResponse>) -> Self {
            ScriptedPort {
                replies: replies.into_iter().collect(),
                ..Default::default()
            }
        }

        fn kinds(&self) -> Vec<CoherenceKind> {
            self.sent.iter().map(|m| m.kind).collect()
        }
    }

    impl CoherencePort for ScriptedPort {
        fn exchange(
            &mut self,
            msg: CoherenceMessage,
            store: &mut CacheLineStore,
        ) -> Result<CoherenceResponse, ProtocolError> {
            self.sent.push(msg);
            for index in self.invalidate_before_reply.drain(..) {
                store.invalidate(index);
            }
            self.replies
                .pop_front()
                .ok_or(ProtocolError::CoordinatorGone {
                    processor: msg.processor,
                })
        }

        fn drain_invalidations(&mut self, store: &mut CacheLineStore) -> usize {
            self.idle_invalidations
                .drain(..)
                .filter(|&index| store.invalidate(index))
                .count()
        }
    }

    const T: u32 = 3;

    fn engine(port: ScriptedPort) -> CacheLookupEngine<ScriptedPort> {
        CacheLookupEngine::new(1, Geometry::default(), port)
    }

    fn address_of(tag: u32, word: usize) -> i32 {
        ((tag << 5) as i32) | ((word as i32) << 2)
    }

    fn line(words: &[(usize, i32)]) -> Vec<i32> {
        let mut line = vec![0; 8];
        for &(i, v) in words {
            line[i] = v;
        }
        line
    }

    #[test]
    fn load_miss_refills_shared() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::grant(
            LineState::Shared,
            vec![5, 0, 0, 0, 0, 0, 0, 0],
        )]));
        let done = e.lookup(&MemoryRequest::load(1, 0)).unwrap();
        assert_eq!(done, Completion::loaded(5));
        assert_eq!(e.port().kinds(), vec![CoherenceKind::LdMiss]);
        assert_eq!(e.port().sent[0].processor, 1);
        assert_eq!(e.store().lookup(0).state, LineState::Shared);
        assert_eq!(e.stats().load_misses, 1);
    }

    #[test]
    fn refill_without_grant_uses_kind_default() {
        let mut ack = CoherenceResponse::ack();
        ack.block = Some(vec![0; 8]);
        let mut e = engine(ScriptedPort::with([ack.clone(), ack]));
        e.lookup(&MemoryRequest::load(1, 0)).unwrap();
        assert_eq!(e.store().lookup(0).state, LineState::Shared);
        e.store_mut().invalidate(0);
        e.lookup(&MemoryRequest::store(1, 0, 4)).unwrap();
        assert_eq!(e.store().lookup(0).state, LineState::Modified);
    }

    #[test]
    fn load_hit_is_silent() {
        let mut e = engine(ScriptedPort::default());
        e.store_mut()
            .install(0, T, LineState::Modified, &line(&[(2, 7)]));
        let done = e.lookup(&MemoryRequest::load(1, address_of(T, 2))).unwrap();
        assert_eq!(done, Completion::loaded(7));
        assert!(e.port().sent.is_empty());
        assert_eq!(e.stats().read_hits, 1);
    }

    #[test]
    fn tag_mismatch_is_a_miss() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::grant(
            LineState::Shared,
            line(&[(1, 11)]),
        )]));
        e.store_mut()
            .install(0, T, LineState::Modified, &line(&[(1, 99)]));
        let done = e
            .lookup(&MemoryRequest::load(1, address_of(T + 1, 1)))
            .unwrap();
        assert_eq!(done, Completion::loaded(11));
        assert_eq!(e.store().lookup(0).tag, T + 1);
    }

    #[test]
    fn store_to_modified_is_silent() {
        let mut e = engine(ScriptedPort::default());
        e.store_mut().install(0, T, LineState::Modified, &line(&[]));
        let done = e
            .lookup(&MemoryRequest::store(1, address_of(T, 4), 42))
            .unwrap();
        assert_eq!(done, Completion::ack());
        assert!(e.port().sent.is_empty());
        assert_eq!(e.store().lookup(0).words[4], 42);
        assert_eq!(e.stats().write_hits, 1);
    }

    #[test]
    fn store_to_shared_upgrades() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::ack()]));
        e.store_mut().install(0, T, LineState::Shared, &line(&[]));
        let done = e
            .lookup(&MemoryRequest::store(1, address_of(T, 6), 99))
            .unwrap();
        assert_eq!(done, Completion::ack());
        assert_eq!(e.port().kinds(), vec![CoherenceKind::SdHit]);
        let l = e.store().lookup(0);
        assert_eq!(l.state, LineState::Modified);
        assert_eq!(l.words[6], 99);
    }

    #[test]
    fn aborted_upgrade_changes_nothing() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::abort()]));
        e.store_mut()
            .install(0, T, LineState::Shared, &line(&[(6, 1)]));
        let done = e
            .lookup(&MemoryRequest::store(1, address_of(T, 6), 99))
            .unwrap();
        assert_eq!(done.outcome, Outcome::TxAbort);
        assert_eq!(done.value, None);
        let l = e.store().lookup(0);
        assert_eq!(l.state, LineState::Shared);
        assert_eq!(l.words, line(&[(6, 1)]));
        assert_eq!(e.stats().aborts, 1);
    }

    #[test]
    fn store_miss_granted_modified_writes_once() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::grant(
            LineState::Modified,
            line(&[(0, 8)]),
        )]));
        let done = e.lookup(&MemoryRequest::store(1, 4, 21)).unwrap();
        assert_eq!(done, Completion::ack());
        assert_eq!(e.port().kinds(), vec![CoherenceKind::SdMiss]);
        assert_eq!(e.store().lookup(0).words[..2], [8, 21]);
    }

    #[test]
    fn store_miss_granted_shared_then_upgrades() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::grant(LineState::Shared, line(&[])),
            CoherenceResponse::ack(),
        ]));
        let done = e.lookup(&MemoryRequest::store(1, 0, 3)).unwrap();
        assert_eq!(done, Completion::ack());
        assert_eq!(
            e.port().kinds(),
            vec![CoherenceKind::SdMiss, CoherenceKind::SdHit]
        );
        assert_eq!(e.store().lookup(0).state, LineState::Modified);
        assert_eq!(e.store().lookup(0).words[0], 3);
    }

    #[test]
    fn aborted_refill_leaves_line_invalid() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::abort()]));
        let done = e.lookup(&MemoryRequest::load(1, 0)).unwrap();
        assert_eq!(done, Completion::aborted());
        assert_eq!(e.port().kinds(), vec![CoherenceKind::LdMiss]);
        assert!(!e.store().lookup(0).is_valid());
    }

    #[test]
    fn refill_nack_is_fatal() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::nack()]));
        let err = e.lookup(&MemoryRequest::store(1, 0, 1)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::RefillNack {
                processor: 1,
                kind: CoherenceKind::SdMiss
            }
        ));
    }

    #[test]
    fn malformed_grants_are_fatal() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::grant(
            LineState::Shared,
            vec![1, 2],
        )]));
        assert!(matches!(
            e.lookup(&MemoryRequest::load(1, 0)).unwrap_err(),
            ProtocolError::MalformedBlock {
                got: 2,
                expected: 8,
                ..
            }
        ));

        let mut e = engine(ScriptedPort::with([CoherenceResponse::grant(
            LineState::Invalid,
            line(&[]),
        )]));
        assert!(matches!(
            e.lookup(&MemoryRequest::load(1, 0)).unwrap_err(),
            ProtocolError::InvalidGrant {
                state: LineState::Invalid,
                ..
            }
        ));
    }

    #[test]
    fn nacked_upgrade_falls_back_to_store_miss() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::nack(),
            CoherenceResponse::grant(LineState::Modified, line(&[(1, 50)])),
        ]));
        e.store_mut().install(0, T, LineState::Shared, &line(&[]));
        let done = e
            .lookup(&MemoryRequest::store(1, address_of(T, 0), 9))
            .unwrap();
        assert_eq!(done, Completion::ack());
        assert_eq!(
            e.port().kinds(),
            vec![CoherenceKind::SdHit, CoherenceKind::SdMiss]
        );
        let l = e.store().lookup(0);
        assert_eq!(l.state, LineState::Modified);
        assert_eq!(l.words[..2], [9, 50]);
    }

    #[test]
    fn invalidated_during_upgrade_refills() {
        let mut port = ScriptedPort::with([
            CoherenceResponse::ack(),
            CoherenceResponse::grant(LineState::Modified, line(&[(0, 77)])),
        ]);
        port.invalidate_before_reply.push(0);
        let mut e = engine(port);
        e.store_mut().install(0, T, LineState::Shared, &line(&[]));
        let done = e
            .lookup(&MemoryRequest::store(1, address_of(T, 1), 5))
            .unwrap();
        assert_eq!(done, Completion::ack());
        assert_eq!(e.store().lookup(0).words[..2], [77, 5]);
    }

    #[test]
    fn stale_upgrade_refilled_shared_upgrades_again() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::nack(),
            CoherenceResponse::grant(LineState::Shared, line(&[(1, 6)])),
            CoherenceResponse::ack(),
        ]));
        e.store_mut().install(0, T, LineState::Shared, &line(&[]));
        let done = e
            .lookup(&MemoryRequest::store(1, address_of(T, 0), 1))
            .unwrap();
        assert_eq!(done, Completion::ack());
        assert_eq!(
            e.port().kinds(),
            vec![
                CoherenceKind::SdHit,
                CoherenceKind::SdMiss,
                CoherenceKind::SdHit
            ]
        );
        let l = e.store().lookup(0);
        assert_eq!(l.state, LineState::Modified);
        assert_eq!(l.words[..2], [1, 6]);
        assert_eq!(e.stats().upgrades, 2);
    }

    #[test]
    fn second_stale_upgrade_is_fatal() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::nack(),
            CoherenceResponse::grant(LineState::Shared, line(&[])),
            CoherenceResponse::nack(),
        ]));
        e.store_mut().install(0, T, LineState::Shared, &line(&[]));
        let address = address_of(T, 0);
        assert!(matches!(
            e.lookup(&MemoryRequest::store(1, address, 1)).unwrap_err(),
            ProtocolError::UpgradeLost { processor: 1, address: a } if a == address
        ));
        assert_eq!(e.port().sent.len(), 3);
    }

    #[test]
    fn abort_outside_transaction_leaves_flag_clear() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::abort(),
            CoherenceResponse::ack(),
            CoherenceResponse::ack(),
        ]));
        assert_eq!(
            e.lookup(&MemoryRequest::load(1, 0)).unwrap(),
            Completion::aborted()
        );
        assert!(!e.in_transaction());
        assert_eq!(e.stats().aborts, 1);
        // A later transaction opens and closes normally.
        e.lookup(&MemoryRequest::tx_begin(1)).unwrap();
        assert!(e.in_transaction());
        e.lookup(&MemoryRequest::tx_end(1)).unwrap();
        assert!(!e.in_transaction());
    }

    #[test]
    fn transaction_flag_follows_begin_and_end() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::ack(),
            CoherenceResponse::ack(),
        ]));
        assert_eq!(e.lookup(&MemoryRequest::tx_begin(1)).unwrap(), Completion::ack());
        assert!(e.in_transaction());
        assert_eq!(e.lookup(&MemoryRequest::tx_end(1)).unwrap(), Completion::ack());
        assert!(!e.in_transaction());
        assert_eq!(
            e.port().kinds(),
            vec![CoherenceKind::TxBegin, CoherenceKind::TxEnd]
        );
    }

    #[test]
    fn tx_begin_accepts_only_ack() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::abort()]));
        assert!(matches!(
            e.lookup(&MemoryRequest::tx_begin(1)).unwrap_err(),
            ProtocolError::UnexpectedResponse {
                kind: CoherenceKind::TxBegin,
                code: ResponseCode::TxAbort,
                ..
            }
        ));
        assert!(!e.in_transaction());
    }

    #[test]
    fn abort_inside_transaction_clears_markers() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::ack(),
            CoherenceResponse::abort(),
        ]));
        e.store_mut()
            .install(0, T, LineState::Shared, &line(&[(0, 4)]));
        e.lookup(&MemoryRequest::tx_begin(1)).unwrap();
        e.lookup(&MemoryRequest::load(1, address_of(T, 0))).unwrap();
        assert!(e.store().lookup(0).transactional);

        let done = e
            .lookup(&MemoryRequest::store(1, address_of(T, 0), 1))
            .unwrap();
        assert_eq!(done, Completion::aborted());
        assert!(!e.in_transaction());
        assert!(!e.store().lookup(0).transactional);
    }

    #[test]
    fn tx_end_abort_is_terminal() {
        let mut e = engine(ScriptedPort::with([
            CoherenceResponse::ack(),
            CoherenceResponse::abort(),
        ]));
        e.lookup(&MemoryRequest::tx_begin(1)).unwrap();
        assert_eq!(
            e.lookup(&MemoryRequest::tx_end(1)).unwrap(),
            Completion::aborted()
        );
        assert!(!e.in_transaction());
    }

    #[test]
    fn misrouted_request_is_rejected() {
        let mut e = engine(ScriptedPort::default());
        assert!(matches!(
            e.lookup(&MemoryRequest::load(2, 0)).unwrap_err(),
            ProtocolError::Misrouted {
                controller: 1,
                request: 2
            }
        ));
    }

    #[test]
    fn idle_invalidation_forces_refill() {
        let mut port = ScriptedPort::with([CoherenceResponse::grant(
            LineState::Shared,
            line(&[(0, 2)]),
        )]);
        port.idle_invalidations.push(0);
        let mut e = engine(port);
        e.store_mut()
            .install(0, T, LineState::Modified, &line(&[(0, 1)]));
        e.sync_invalidations();
        assert_eq!(e.stats().invalidations, 1);
        let done = e.lookup(&MemoryRequest::load(1, address_of(T, 0))).unwrap();
        assert_eq!(done, Completion::loaded(2));
        assert_eq!(e.port().kinds(), vec![CoherenceKind::LdMiss]);
    }

    #[test]
    fn report_counts_misses() {
        let mut e = engine(ScriptedPort::with([CoherenceResponse::grant(
            LineState::Shared,
            line(&[]),
        )]));
        e.lookup(&MemoryRequest::load(1, 0)).unwrap();
        e.lookup(&MemoryRequest::load(1, 4)).unwrap();
        let report = e.make_stats();
        assert_eq!(report.operations, 2);
        assert_eq!(report.miss_rate, 0.5);
    }
}
