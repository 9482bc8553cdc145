use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest as _, Sha256};
use tokio::sync::OnceCell;

use crate::error::StoryError;

type Slot<T> = Arc<OnceCell<Result<T, StoryError>>>;

/// Collapses concurrent calls for the same request into one backend call.
///
/// Callers that arrive while a request with the same signature is running
/// wait for its result instead of issuing their own. The slot is dropped once
/// the call finishes, so a later call with the same signature runs again.
#[derive(Debug)]
pub struct InFlight<T> {
    slots: Arc<Mutex<HashMap<String, Slot<T>>>>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Clone for InFlight<T> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, signature: &str, op: F) -> Result<T, StoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoryError>>,
    {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(signature) {
                Some(slot) => {
                    tracing::debug!(signature, "joining in-flight request");
                    Arc::clone(slot)
                }
                None => {
                    let slot: Slot<T> = Arc::new(OnceCell::new());
                    slots.insert(signature.to_owned(), Arc::clone(&slot));
                    slot
                }
            }
        };

        let result = slot.get_or_init(op).await.clone();

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(signature)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            slots.remove(signature);
        }
        result
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Stable signature for a request: sha256 hex of the endpoint and body.
pub fn signature(endpoint: &str, body: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
