use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::bridge_messages::{ErrorBody, ErrorKind, RequestId, Response};

/// Requests awaiting their response
///
/// Every entry is removed exactly once, by whichever comes first: its response, its deadline,
/// a cancellation or the connection dropping. Whoever removes the entry completes it, so a
/// caller never receives two answers and never waits forever.
#[derive(Default)]
pub struct PendingCallTable {
    entries: Mutex<HashMap<RequestId, oneshot::Sender<Response>>>,
}

#[derive(Debug, thiserror::Error)]
#[error("Request {0} is already pending")]
pub struct DuplicateRequestId(pub RequestId);

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns the receiver its response will arrive on
    pub fn register(&self, id: RequestId) -> Result<oneshot::Receiver<Response>, DuplicateRequestId> {
        let (sender, receiver) = oneshot::channel();
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(DuplicateRequestId(id));
        }
        entries.insert(id, sender);
        Ok(receiver)
    }

    /// Delivers a response to its waiting caller
    ///
    /// Returns false if nobody is waiting for this id anymore (late or unknown response).
    pub fn complete(&self, response: Response) -> bool {
        let sender = self.lock().remove(&response.id);
        match sender {
            // The caller may have stopped listening, the entry is gone either way
            Some(sender) => {
                let _ = sender.send(response);
                true
            }
            None => false,
        }
    }

    /// Completes a pending request with an error
    pub fn fail(&self, id: RequestId, error: ErrorBody) -> bool {
        self.complete(Response::error(id, error))
    }

    /// Drops a pending request without answering it
    ///
    /// Used by the caller itself after its own deadline fired.
    pub fn remove(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Completes every pending request with the same error, returns how many there were
    pub fn fail_all(&self, kind: ErrorKind, message: &str) -> usize {
        let drained: Vec<(RequestId, oneshot::Sender<Response>)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, sender) in drained {
            let _ = sender.send(Response::error(id, ErrorBody::new(kind, message)));
        }
        count
    }

    /// Whether a request is still pending
    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<Response>>> {
        // A panic while holding the lock can't leave the map half-updated
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
