//! Consumer side of a session: where child output and the exit notice go.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use crate::pty::ExitStatus;

/// Receives a session's output and exit notification.
///
/// `on_data` is offered bytes in the order the child produced them and
/// returns how many it accepted. Accepting fewer than offered is
/// backpressure: the rest stays queued and reading from the terminal pauses
/// once the queue is full. `on_exit` is called once, after every byte the
/// child wrote has been accepted.
pub trait Consumer: Send {
    fn on_data(&mut self, data: &[u8]) -> usize;

    fn on_exit(&mut self, status: ExitStatus);
}

/// What a [`ChannelConsumer`] forwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Data(Vec<u8>),
    Exit(ExitStatus),
}

/// Pull-style adapter: forwards output into a bounded channel.
///
/// At most `bound` data messages are in flight; beyond that `on_data`
/// refuses, which turns into backpressure on the terminal. One extra slot is
/// kept for the exit notice so it never has to wait.
#[derive(Debug)]
pub struct ChannelConsumer {
    tx: SyncSender<ConsumerEvent>,
    in_flight: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    bound: usize,
}

/// Receiving end of a [`ChannelConsumer`]
#[derive(Debug)]
pub struct ConsumerReceiver {
    rx: Receiver<ConsumerEvent>,
    in_flight: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl ChannelConsumer {
    pub fn new(bound: usize) -> (Self, ConsumerReceiver) {
        let bound = bound.max(1);
        let (tx, rx) = mpsc::sync_channel(bound + 1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        (
            ChannelConsumer {
                tx,
                in_flight: Arc::clone(&in_flight),
                closed: Arc::clone(&closed),
                bound,
            },
            ConsumerReceiver {
                rx,
                in_flight,
                closed,
            },
        )
    }
}

impl Consumer for ChannelConsumer {
    fn on_data(&mut self, data: &[u8]) -> usize {
        // Receiver is gone; discard rather than stall the session
        if self.closed.load(Ordering::Acquire) {
            return data.len();
        }
        if self.in_flight.load(Ordering::Acquire) >= self.bound {
            return 0;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(ConsumerEvent::Data(data.to_vec())) {
            Ok(()) => data.len(),
            Err(TrySendError::Full(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                0
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                data.len()
            }
        }
    }

    fn on_exit(&mut self, status: ExitStatus) {
        let _ = self.tx.try_send(ConsumerEvent::Exit(status));
    }
}

impl ConsumerReceiver {
    pub fn try_recv(&self) -> Result<ConsumerEvent, TryRecvError> {
        self.rx.try_recv().map(|event| self.received(event))
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<ConsumerEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout).map(|event| self.received(event))
    }

    fn received(&self, event: ConsumerEvent) -> ConsumerEvent {
        if matches!(event, ConsumerEvent::Data(_)) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

impl Drop for ConsumerReceiver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
