//! Fixed-capacity FIFO handoff between pipeline stages. Every wait is bounded by a timeout.

use crossbeam_channel::{
    Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError, bounded,
};
use std::sync::Arc;
use std::time::Duration;

/// Push failed; the item is handed back so the caller can count it as a drop.
#[derive(Debug)]
pub enum PushError<T> {
    /// Still full after the timeout.
    Full(T),
    /// Every receiver is gone.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(t) | PushError::Closed(t) => t,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }
}

/// Pop found nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PopError {
    /// Still empty after the timeout; loop and check the shutdown flag.
    Empty,
    /// Empty and every sender is gone.
    Closed,
}

/// Named bounded channel. Construct with [`BoundedChannel::new`] to get the two ends.
pub struct BoundedChannel;

impl BoundedChannel {
    /// Create a channel holding at most `capacity` items (minimum 1).
    pub fn new<T>(name: &str, capacity: usize) -> (ChannelTx<T>, ChannelRx<T>) {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded::<T>(capacity);
        let name: Arc<str> = name.into();
        (
            ChannelTx {
                name: name.clone(),
                capacity,
                tx,
            },
            ChannelRx { name, capacity, rx },
        )
    }
}

/// Producer end. Cloneable.
pub struct ChannelTx<T> {
    name: Arc<str>,
    capacity: usize,
    tx: Sender<T>,
}

impl<T> Clone for ChannelTx<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            capacity: self.capacity,
            tx: self.tx.clone(),
        }
    }
}

impl<T> ChannelTx<T> {
    /// Push, waiting at most `timeout` for space. Never blocks longer; a zero timeout does not wait.
    pub fn try_push(&self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        if timeout.is_zero() {
            return self.tx.try_send(item).map_err(|e| match e {
                TrySendError::Full(t) => PushError::Full(t),
                TrySendError::Disconnected(t) => PushError::Closed(t),
            });
        }
        self.tx.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(t) => PushError::Full(t),
            SendTimeoutError::Disconnected(t) => PushError::Closed(t),
        })
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Consumer end. Cloneable (a clone is also how the status reporter reads queue depth).
pub struct ChannelRx<T> {
    name: Arc<str>,
    capacity: usize,
    rx: Receiver<T>,
}

impl<T> Clone for ChannelRx<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            capacity: self.capacity,
            rx: self.rx.clone(),
        }
    }
}

impl<T> ChannelRx<T> {
    /// Pop the oldest item, waiting at most `timeout`. A zero timeout does not wait.
    pub fn try_pop(&self, timeout: Duration) -> Result<T, PopError> {
        if timeout.is_zero() {
            return self.rx.try_recv().map_err(|e| match e {
                TryRecvError::Empty => PopError::Empty,
                TryRecvError::Disconnected => PopError::Closed,
            });
        }
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => PopError::Empty,
            RecvTimeoutError::Disconnected => PopError::Closed,
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
