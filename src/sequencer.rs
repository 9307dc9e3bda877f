use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, SendError, Sender};
use log::{error, info};

use crate::{
    coherence::CoherencePort,
    engine::CacheLookupEngine,
    error::{Error, ProtocolError},
    protocol::{MemoryRequest, Outcome, ProcessorId},
};

/// Terminal answer to one request, emitted in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub request: MemoryRequest,
    pub outcome: Outcome,
    pub value: Option<i32>,
}

/// Serializes one processor's requests through its engine on a dedicated
/// worker thread. The next request is not taken off the ingress queue until
/// the previous one has produced its response.
pub struct RequestSequencer<P: CoherencePort + Send + 'static> {
    id: ProcessorId,
    ingress: Sender<MemoryRequest>,
    handle: JoinHandle<Result<CacheLookupEngine<P>, ProtocolError>>,
}

impl<P: CoherencePort + Send + 'static> RequestSequencer<P> {
    /// Starts the worker. `queue_depth` bounds the ingress queue; responses
    /// go to `egress`, which may be shared between sequencers.
    pub fn spawn(
        engine: CacheLookupEngine<P>,
        queue_depth: usize,
        egress: Sender<Response>,
    ) -> Result<Self, Error> {
        let id = engine.id();
        let (ingress, requests) = channel::bounded(queue_depth);
        let handle = thread::Builder::new()
            .name(format!("controller {id}"))
            .spawn(move || Self::run_thread(engine, requests, egress))?;
        Ok(RequestSequencer {
            id,
            ingress,
            handle,
        })
    }

    fn run_thread(
        mut engine: CacheLookupEngine<P>,
        requests: Receiver<MemoryRequest>,
        egress: Sender<Response>,
    ) -> Result<CacheLookupEngine<P>, ProtocolError> {
        let id = engine.id();
        info!("controller {id}: started");
        for request in requests.iter() {
            engine.sync_invalidations();
            let completion = match engine.lookup(&request) {
                Ok(completion) => completion,
                Err(err) => {
                    error!("controller {id}: halting on {request}: {err}");
                    return Err(err);
                }
            };
            let response = Response {
                request,
                outcome: completion.outcome,
                value: completion.value,
            };
            if egress.send(response).is_err() {
                info!("controller {id}: egress closed");
                break;
            }
        }
        info!("controller {id}: stopped");
        Ok(engine)
    }

    pub fn id(&self) -> ProcessorId {
        self.id
    }

    /// Queues a request, blocking while the ingress queue is full. Fails
    /// once the worker has halted.
    pub fn submit(&self, request: MemoryRequest) -> Result<(), Error> {
        self.ingress
            .send(request)
            .map_err(|SendError(_)| Error::ControllerHalted(self.id))
    }

    /// Closes ingress, lets the worker finish what is queued, and hands the
    /// engine back.
    pub fn finish(self) -> Result<CacheLookupEngine<P>, Error> {
        let RequestSequencer { id, ingress, handle } = self;
        drop(ingress);
        match handle.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::WorkerPanicked(format!("controller {id}"))),
        }
    }
}
