//! Rendezvous channel between controllers and the coordinator.
//!
//! Every [`CoherenceMessage`] travels with its own single-slot reply
//! channel, so a controller can only ever resume on the answer to the
//! message it sent. Invalidates arrive on a separate per-controller queue
//! and are applied in arrival order, including while a controller is
//! parked on a reply.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};

use crate::{
    cache::CacheLineStore,
    error::ProtocolError,
    protocol::{CoherenceMessage, CoherenceResponse, Invalidate, ProcessorId},
};

/// The controller's only path to shared state.
pub trait CoherencePort {
    /// Sends one message and blocks until its response arrives. Invalidates
    /// that land first are applied to `store` before returning.
    fn exchange(
        &mut self,
        msg: CoherenceMessage,
        store: &mut CacheLineStore,
    ) -> Result<CoherenceResponse, ProtocolError>;

    /// Applies invalidates that arrived while the controller was idle.
    /// Returns how many were applied.
    fn drain_invalidations(&mut self, store: &mut CacheLineStore) -> usize;
}

/// A message as seen by the coordinator, carrying its reply slot.
#[derive(Debug)]
pub struct CoherenceEnvelope {
    pub message: CoherenceMessage,
    reply: Sender<CoherenceResponse>,
}

impl CoherenceEnvelope {
    /// Returns `false` if the sender gave up waiting.
    pub fn respond(self, response: CoherenceResponse) -> bool {
        self.reply.send(response).is_ok()
    }
}

/// Coordinator side of the fabric.
#[derive(Debug)]
pub struct CoordinatorLink {
    pub requests: Receiver<CoherenceEnvelope>,
    invalidators: Vec<Sender<Invalidate>>,
}

impl CoordinatorLink {
    /// Pushes an invalidate to one controller. Returns `false` if that
    /// controller is gone or was never created.
    pub fn invalidate(&self, processor: ProcessorId, block_index: usize) -> bool {
        self.invalidators
            .get(processor as usize)
            .is_some_and(|tx| tx.send(Invalidate { block_index }).is_ok())
    }

    /// Answers messages until every client has hung up.
    pub fn serve<F>(self, mut respond: F)
    where
        F: FnMut(&CoherenceMessage, &CoordinatorLink) -> CoherenceResponse,
    {
        while let Ok(envelope) = self.requests.recv() {
            let response = respond(&envelope.message, &self);
            let processor = envelope.message.processor;
            if !envelope.respond(response) {
                warn!("proc {processor}: dropped its reply slot");
            }
        }
    }
}

/// Controller side of the fabric.
#[derive(Debug)]
pub struct CoherenceClient {
    processor: ProcessorId,
    requests: Sender<CoherenceEnvelope>,
    invalidations: Receiver<Invalidate>,
    invalidations_open: bool,
    timeout: Option<Duration>,
}

impl CoherenceClient {
    pub fn processor(&self) -> ProcessorId {
        self.processor
    }

    fn apply_pending(&self, store: &mut CacheLineStore) -> usize {
        let processor = self.processor;
        self.invalidations
            .try_iter()
            .filter(|&inv| apply(processor, inv, store))
            .count()
    }
}

/// Builds one client per processor `0..processors`, all wired to a single
/// coordinator link.
pub fn fabric(
    processors: usize,
    timeout: Option<Duration>,
) -> (CoordinatorLink, Vec<CoherenceClient>) {
    let (req_tx, req_rx) = channel::unbounded();
    let mut invalidators = Vec::with_capacity(processors);
    let clients = (0..processors)
        .map(|id| {
            let (inv_tx, inv_rx) = channel::unbounded();
            invalidators.push(inv_tx);
            CoherenceClient {
                processor: id as ProcessorId,
                requests: req_tx.clone(),
                invalidations: inv_rx,
                invalidations_open: true,
                timeout,
            }
        })
        .collect();
    (
        CoordinatorLink {
            requests: req_rx,
            invalidators,
        },
        clients,
    )
}

fn apply(processor: ProcessorId, inv: Invalidate, store: &mut CacheLineStore) -> bool {
    if store.invalidate(inv.block_index) {
        debug!("proc {processor}: invalidated line {}", inv.block_index);
        true
    } else {
        warn!(
            "proc {processor}: ignoring invalidate for line {} of {}",
            inv.block_index,
            store.len()
        );
        false
    }
}

impl CoherencePort for CoherenceClient {
    fn exchange(
        &mut self,
        msg: CoherenceMessage,
        store: &mut CacheLineStore,
    ) -> Result<CoherenceResponse, ProtocolError> {
        let processor = self.processor;
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.requests
            .send(CoherenceEnvelope {
                message: msg,
                reply: reply_tx,
            })
            .map_err(|_| ProtocolError::CoordinatorGone { processor })?;
        debug!("proc {processor}: sent {} for {:#x}", msg.kind, msg.address);

        let deadline = match self.timeout {
            Some(timeout) => channel::after(timeout),
            None => channel::never(),
        };
        let closed = channel::never();
        loop {
            let invalidations = if self.invalidations_open {
                &self.invalidations
            } else {
                &closed
            };
            let mut hung_up = false;
            crossbeam::select! {
                recv(reply_rx) -> response => {
                    let response =
                        response.map_err(|_| ProtocolError::CoordinatorGone { processor })?;
                    // Invalidates sent ahead of this reply are already queued.
                    self.apply_pending(store);
                    debug!("proc {processor}: {} answered {}", msg.kind, response.code);
                    return Ok(response);
                }
                recv(invalidations) -> inv => match inv {
                    Ok(inv) => {
                        apply(processor, inv, store);
                    }
                    Err(_) => hung_up = true,
                },
                recv(deadline) -> _ => {
                    return Err(ProtocolError::Timeout {
                        processor,
                        kind: msg.kind,
                        timeout: self.timeout.unwrap_or_default(),
                    });
                }
            }
            if hung_up {
                self.invalidations_open = false;
            }
        }
    }

    fn drain_invalidations(&mut self, store: &mut CacheLineStore) -> usize {
        self.apply_pending(store)
    }
}
