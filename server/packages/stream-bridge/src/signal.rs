use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::bridge::BridgeOutcome;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeFailure {
    #[error("callback stream read failed: {0}")]
    Read(String),
    #[error("no callback received within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("bridge dropped before completion")]
    Abandoned,
}

type Settlement = Result<BridgeOutcome, BridgeFailure>;

/// Producer half of a single-fire completion handoff.
///
/// Clones share one slot; whichever clone settles first wins and every
/// later call reports `false`.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    slot: Arc<Mutex<Option<oneshot::Sender<Settlement>>>>,
}

#[derive(Debug)]
pub struct CompletionWaiter {
    receiver: oneshot::Receiver<Settlement>,
}

pub fn completion_pair() -> (CompletionSignal, CompletionWaiter) {
    let (sender, receiver) = oneshot::channel();
    (
        CompletionSignal {
            slot: Arc::new(Mutex::new(Some(sender))),
        },
        CompletionWaiter { receiver },
    )
}

impl CompletionSignal {
    pub fn resolve(&self, outcome: BridgeOutcome) -> bool {
        self.settle(Ok(outcome))
    }

    pub fn reject(&self, failure: BridgeFailure) -> bool {
        self.settle(Err(failure))
    }

    pub fn is_settled(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    fn settle(&self, settlement: Settlement) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(sender) => {
                // The waiter may already be gone; the settlement still counts.
                let _ = sender.send(settlement);
                true
            }
            None => false,
        }
    }
}

impl CompletionWaiter {
    pub async fn wait(self) -> Settlement {
        self.receiver.await.unwrap_or(Err(BridgeFailure::Abandoned))
    }
}
