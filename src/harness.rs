//! Stand-in responder for driving traces without a real directory.
//!
//! It grants every request and never invalidates anyone, so it exercises a
//! controller's request paths but says nothing about coherence between
//! processors. Aborts can be injected at random on line requests.

use log::trace;

use crate::protocol::{CoherenceKind, CoherenceMessage, CoherenceResponse};

pub struct AckingCoordinator {
    words_per_line: usize,
    abort_rate: f64,
    rng: fastrand::Rng,
    pub served: u64,
    pub aborts: u64,
}

impl AckingCoordinator {
    pub fn new(words_per_line: usize, abort_rate: f64, seed: Option<u64>) -> Self {
        AckingCoordinator {
            words_per_line,
            abort_rate: abort_rate.clamp(0.0, 1.0),
            rng: seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed),
            served: 0,
            aborts: 0,
        }
    }

    pub fn respond(&mut self, msg: &CoherenceMessage) -> CoherenceResponse {
        self.served += 1;
        let response = match msg.kind {
            CoherenceKind::TxBegin | CoherenceKind::TxEnd => CoherenceResponse::ack(),
            _ if self.abort_rate > 0.0 && self.rng.f64() < self.abort_rate => {
                self.aborts += 1;
                CoherenceResponse::abort()
            }
            CoherenceKind::SdHit => CoherenceResponse::ack(),
            kind @ (CoherenceKind::LdMiss | CoherenceKind::SdMiss) => {
                CoherenceResponse::grant(kind.default_grant(), vec![0; self.words_per_line])
            }
        };
        trace!(
            "coordinator: {} from proc {} -> {}",
            msg.kind,
            msg.processor,
            response.code
        );
        response
    }
}
