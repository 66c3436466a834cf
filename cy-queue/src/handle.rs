//! Single-assignment result delivery shared by every attempt of a call.

use crate::error::QueueError;
use cy_llm::ChatResponse;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use uuid::Uuid;

pub type CallOutcome = std::result::Result<ChatResponse, QueueError>;

/// Producer side. The sender is taken on first resolve, so a call can never
/// be resolved twice no matter how many attempts hold the slot.
#[derive(Debug)]
pub(crate) struct ResultSlot {
    sender: Mutex<Option<oneshot::Sender<CallOutcome>>>,
}

impl ResultSlot {
    pub(crate) fn new(call_id: Uuid) -> (Self, ResultHandle) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            sender: Mutex::new(Some(tx)),
        };
        let handle = ResultHandle {
            call_id,
            rx: Some(rx),
            ready: None,
        };
        (slot, handle)
    }

    /// Returns false if the slot was already resolved.
    pub(crate) fn resolve(&self, outcome: CallOutcome) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(sender) = sender else {
            return false;
        };
        // The caller may have dropped its handle; that is not an error here.
        let _ = sender.send(outcome);
        true
    }

    pub(crate) fn is_resolved(&self) -> bool {
        match self.sender.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

/// Caller side of an enqueued call. Await it for the outcome.
///
/// The outcome is delivered once. After [`ResultHandle::try_take`] has
/// returned it, awaiting the handle yields [`QueueError::AlreadyTaken`].
#[derive(Debug)]
pub struct ResultHandle {
    call_id: Uuid,
    /// `None` once an outcome has been received.
    rx: Option<oneshot::Receiver<CallOutcome>>,
    ready: Option<CallOutcome>,
}

impl ResultHandle {
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Non-blocking check. True once an outcome has arrived, taken or not.
    pub fn is_resolved(&mut self) -> bool {
        self.fill();
        self.rx.is_none()
    }

    /// Take the outcome if it has arrived and was not taken before.
    pub fn try_take(&mut self) -> Option<CallOutcome> {
        self.fill();
        self.ready.take()
    }

    fn fill(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return;
        };
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => Err(QueueError::Abandoned),
        };
        self.rx = None;
        self.ready = Some(outcome);
    }
}

impl Future for ResultHandle {
    type Output = CallOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.ready.take() {
            return Poll::Ready(outcome);
        }
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(QueueError::AlreadyTaken));
        };
        let outcome = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(received) => received.unwrap_or(Err(QueueError::Abandoned)),
        };
        this.rx = None;
        Poll::Ready(outcome)
    }
}
