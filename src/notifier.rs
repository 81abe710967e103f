//! Outbound events and their fan-out to clients.
//!
//! The resource pushes three kinds of events at connected clients: revision
//! updates, per-command completions, and typed notifications (status,
//! warnings, progress, flush completions, inspection results). Failures are
//! never surfaced as errors across the client boundary, only as typed
//! notifications addressed by command or request id.
//!
//! Delivery uses bounded crossbeam channels with an [`AtomicWaker`] bridge
//! so subscribers can consume events as an async [`Stream`] without the
//! emitter ever blocking the engine.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use atomic_waker::AtomicWaker;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{EntityType, Identifier, ResourceStatus, Revision};

/// Capacity of one subscriber channel; events beyond it are dropped.
const SUBSCRIBER_BUFFER: usize = 1024;

/// The kind of a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    /// The resource is shutting down.
    Shutdown,
    /// Resource status changed (see [`ResourceStatus`]).
    Status,
    /// Something went wrong but processing continues.
    Warning,
    /// A request failed.
    Error,
    /// Informational, e.g. sync started/finished.
    Info,
    /// Progress of a long-running request.
    Progress,
    /// Result of an inspection command.
    Inspection,
    /// A flush barrier completed.
    FlushCompletion,
}

/// A typed notification addressed to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Kind of the notification.
    pub notification_type: NotificationType,
    /// Status or error code, kind-dependent.
    pub code: u32,
    /// Correlates with a command, flush or sync request id.
    pub id: String,
    /// Human-readable detail.
    pub message: String,
    /// Entities the notification applies to.
    pub entities: Vec<Identifier>,
    /// Type of the entities above.
    pub entities_type: Option<EntityType>,
    /// Progress so far, for [`NotificationType::Progress`].
    pub progress: Option<u64>,
    /// Total work, for [`NotificationType::Progress`].
    pub total: Option<u64>,
}

impl Notification {
    fn new(notification_type: NotificationType) -> Self {
        Self {
            notification_type,
            code: 0,
            id: String::new(),
            message: String::new(),
            entities: Vec::new(),
            entities_type: None,
            progress: None,
            total: None,
        }
    }

    /// A flush-completion notification for the given flush id.
    pub fn flush_completion(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::new(NotificationType::FlushCompletion)
        }
    }

    /// A status notification.
    pub fn status(status: ResourceStatus, message: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            code: status as u32,
            id: id.into(),
            message: message.into(),
            ..Self::new(NotificationType::Status)
        }
    }

    /// A warning notification.
    pub fn warning(code: u32, message: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            code,
            id: id.into(),
            message: message.into(),
            ..Self::new(NotificationType::Warning)
        }
    }

    /// An error notification.
    pub fn error(code: u32, message: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            code,
            id: id.into(),
            message: message.into(),
            ..Self::new(NotificationType::Error)
        }
    }

    /// An info notification scoped to some entities.
    pub fn info(
        code: u32,
        entities_type: Option<EntityType>,
        entities: Vec<Identifier>,
    ) -> Self {
        Self {
            code,
            entities,
            entities_type,
            ..Self::new(NotificationType::Info)
        }
    }

    /// A progress notification.
    pub fn progress(
        progress: u64,
        total: u64,
        id: impl Into<String>,
        entities_type: Option<EntityType>,
        entities: Vec<Identifier>,
    ) -> Self {
        Self {
            id: id.into(),
            entities,
            entities_type,
            progress: Some(progress),
            total: Some(total),
            ..Self::new(NotificationType::Progress)
        }
    }

    /// An inspection result; code 0 means the expectation held.
    pub fn inspection(id: impl Into<String>, code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            id: id.into(),
            message: message.into(),
            ..Self::new(NotificationType::Inspection)
        }
    }

    /// A shutdown announcement.
    pub fn shutdown() -> Self {
        Self::new(NotificationType::Shutdown)
    }
}

/// One outbound event.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// A pipeline commit advanced the store to this revision.
    RevisionUpdate(Revision),
    /// A client command finished, successfully or not.
    CommandCompletion {
        /// The client-assigned message id.
        message_id: u64,
        /// Whether the command applied.
        success: bool,
    },
    /// A typed notification.
    Notification(Notification),
}

// ============================================================================
// Channel bridge
// ============================================================================

/// Sending half of an event channel.
pub struct EmitHandle<T> {
    tx: Option<Sender<T>>,
    waker: Arc<AtomicWaker>,
}

impl<T> EmitHandle<T> {
    /// Sends an event; returns false once the subscriber is gone.
    ///
    /// A full buffer drops the event rather than blocking the engine.
    pub fn send(&self, event: T) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.waker.wake();
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Subscriber buffer full, dropping event");
                self.waker.wake();
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl<T> Drop for EmitHandle<T> {
    fn drop(&mut self) {
        // Disconnect first, then wake, so a parked consumer observes the
        // closed channel instead of sleeping forever.
        self.tx = None;
        self.waker.wake();
    }
}

/// Receiving half of an event channel, consumable as an async [`Stream`].
pub struct EventStream<T> {
    rx: Receiver<T>,
    waker: Arc<AtomicWaker>,
}

impl<T> EventStream<T> {
    /// Non-blocking receive, for synchronous consumers.
    pub fn try_next(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drains everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        match self.rx.try_recv() {
            Ok(event) => return Poll::Ready(Some(event)),
            Err(crossbeam_channel::TryRecvError::Disconnected) => return Poll::Ready(None),
            Err(crossbeam_channel::TryRecvError::Empty) => {}
        }
        self.waker.register(cx.waker());
        // Re-check to close the race between try_recv and register.
        match self.rx.try_recv() {
            Ok(event) => Poll::Ready(Some(event)),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Poll::Ready(None),
            Err(crossbeam_channel::TryRecvError::Empty) => Poll::Pending,
        }
    }
}

/// Creates a bounded event channel with an async-aware receiver.
pub fn event_channel<T>() -> (EmitHandle<T>, EventStream<T>) {
    let (tx, rx) = bounded(SUBSCRIBER_BUFFER);
    let waker = Arc::new(AtomicWaker::new());
    (
        EmitHandle {
            tx: Some(tx),
            waker: Arc::clone(&waker),
        },
        EventStream { rx, waker },
    )
}

// ============================================================================
// Notifier
// ============================================================================

/// Fan-out of [`ClientEvent`]s to all connected clients.
///
/// Subscribers that disappeared are pruned on the next emission.
#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<EmitHandle<ClientEvent>>>,
}

impl Notifier {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> EventStream<ClientEvent> {
        let (tx, rx) = event_channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Emits an event to every live subscriber.
    pub fn emit(&self, event: ClientEvent) {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .retain(|s| s.send(event.clone()));
    }

    /// Convenience wrapper emitting a notification event.
    pub fn notify(&self, notification: Notification) {
        self.emit(ClientEvent::Notification(notification));
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_events() {
        let notifier = Notifier::new();
        let stream = notifier.subscribe();
        notifier.emit(ClientEvent::RevisionUpdate(4));
        notifier.notify(Notification::flush_completion("f1"));

        assert_eq!(stream.try_next(), Some(ClientEvent::RevisionUpdate(4)));
        match stream.try_next() {
            Some(ClientEvent::Notification(n)) => {
                assert_eq!(n.notification_type, NotificationType::FlushCompletion);
                assert_eq!(n.id, "f1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(stream.try_next(), None);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = Notifier::new();
        let stream = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(stream);
        notifier.emit(ClientEvent::RevisionUpdate(1));
        assert_eq!(notifier.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn event_stream_wakes_async_consumers() {
        use futures::StreamExt;

        let (tx, mut rx) = event_channel::<u32>();
        let reader = tokio::spawn(async move { rx.next().await });
        tokio::task::yield_now().await;
        assert!(tx.send(7));
        assert_eq!(reader.await.unwrap(), Some(7));
    }
}
