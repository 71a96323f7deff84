//! Bounded delivery of key-space events.
//!
//! The store pushes events from its write path and must never wait on a slow subscriber.
//! A row event that does not fit the queue is dropped and folded into one
//! [`KeySpaceEventKind::Overflow`] marker per subscription; the receiver hands markers out
//! ahead of queued events, and the subscriber re-reads whatever that subscription covers.
//! A `SubscriptionError` that does not fit is parked the same way so it is never lost.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;

use super::KeySpaceEvent;
use super::KeySpaceEventKind;
use super::SubscriptionHandle;

#[derive(Debug, Default)]
struct Parked {
    failed: BTreeSet<SubscriptionHandle>,
    overflowed: BTreeSet<SubscriptionHandle>,
}

impl Parked {
    fn len(&self) -> usize {
        self.failed.len() + self.overflowed.len()
    }
}

#[derive(Debug, Default)]
struct Backlog {
    parked: Mutex<Parked>,
    wake: Notify,
}

/// Sending half handed to [`StoreClient::subscribe_key_space`](super::StoreClient).
#[derive(Debug, Clone)]
pub struct KeySpaceSink {
    events: mpsc::Sender<KeySpaceEvent>,
    backlog: Arc<Backlog>,
}

/// Receiving half owned by the subscriber.
#[derive(Debug)]
pub struct KeySpaceReceiver {
    events: mpsc::Receiver<KeySpaceEvent>,
    backlog: Arc<Backlog>,
}

/// Creates a sink holding at most `capacity` queued events plus one marker per
/// subscription.
pub fn key_space_channel(capacity: usize) -> (KeySpaceSink, KeySpaceReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let backlog = Arc::new(Backlog::default());
    (
        KeySpaceSink {
            events: tx,
            backlog: backlog.clone(),
        },
        KeySpaceReceiver { events: rx, backlog },
    )
}

impl KeySpaceSink {
    /// Never blocks. Returns false once the receiver is gone.
    pub fn deliver(
        &self,
        event: KeySpaceEvent,
    ) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                {
                    let mut parked = self.backlog.parked.lock();
                    match event.kind {
                        KeySpaceEventKind::SubscriptionError => {
                            parked.failed.insert(event.handle);
                        }
                        // Nothing is delivered after a close, so there is nothing to resync
                        KeySpaceEventKind::SubscriptionClosed => return true,
                        _ => {
                            parked.overflowed.insert(event.handle);
                        }
                    }
                }
                self.backlog.wake.notify_one();
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

impl KeySpaceReceiver {
    /// Next parked marker if any, otherwise the next queued event. `None` once every sink
    /// is dropped (or the receiver closed) and the queue is drained.
    pub async fn recv(&mut self) -> Option<KeySpaceEvent> {
        loop {
            if let Some(event) = self.take_parked() {
                return Some(event);
            }
            tokio::select! {
                biased;
                _ = self.backlog.wake.notified() => {}
                event = self.events.recv() => return event,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<KeySpaceEvent> {
        self.take_parked().or_else(|| self.events.try_recv().ok())
    }

    /// Stops accepting events; already queued ones can still be received.
    pub fn close(&mut self) {
        self.events.close();
    }

    /// Queued events plus parked markers.
    pub fn len(&self) -> usize {
        self.events.len() + self.backlog.parked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_parked(&self) -> Option<KeySpaceEvent> {
        let mut parked = self.backlog.parked.lock();
        if let Some(handle) = parked.failed.pop_first() {
            return Some(KeySpaceEvent {
                handle,
                row: None,
                kind: KeySpaceEventKind::SubscriptionError,
            });
        }
        parked.overflowed.pop_first().map(|handle| KeySpaceEvent {
            handle,
            row: None,
            kind: KeySpaceEventKind::Overflow,
        })
    }
}
