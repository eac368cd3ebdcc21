//! Buffered queue implementations.
//!
//! A buffered queue is a FIFO of items with a single writer and a single reader. The funnel merges through
//! buffered queues and the sorter stores its runs in them. The following backends are provided:
//!
//! * [`MemoryQueue`]: records serialized into a growable heap buffer,
//! * [`MappedQueue`]: records serialized into a memory-mapped scratch file,
//! * [`ChainedQueue`]: a chain of bounded segments spilling from heap to mapped scratch files,
//! * [`ChannelQueue`]: a blocking bounded channel connecting a producer thread to a consumer.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::io;
use std::marker::PhantomData;

pub mod chained;
pub mod channel;
pub mod serial;
pub mod storage;

pub use chained::{ChainedQueue, ChainedQueueBuilder};
pub use channel::{ChannelQueue, ChannelWriter};
pub use serial::{MappedQueue, MappedQueueBuilder, MemoryQueue, MemoryQueueBuilder, SerialQueue};
pub use storage::{HeapStorage, MappedStorage, Storage};

/// Queue error.
#[derive(Debug)]
pub enum QueueError {
    /// Scratch file, resize or mapping failure.
    Io(io::Error),
    /// Serialized record exceeds the configured limit.
    ItemTooLarge { len: usize, limit: usize },
    /// Write to a bounded queue that is already full.
    QueueFull { capacity: usize },
    /// Queue or funnel used against its contract.
    ProtocolViolation(&'static str),
    /// Item serialization error.
    Serialization(Box<dyn Error + Send + Sync>),
    /// Item deserialization error.
    Deserialization(Box<dyn Error + Send + Sync>),
}

impl Error for QueueError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            QueueError::Io(err) => Some(err),
            QueueError::Serialization(err) => Some(err.as_ref()),
            QueueError::Deserialization(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            QueueError::Io(err) => write!(f, "queue I/O operation failed: {}", err),
            QueueError::ItemTooLarge { len, limit } => {
                write!(f, "serialized item of {} bytes exceeds the limit of {} bytes", len, limit)
            }
            QueueError::QueueFull { capacity } => write!(f, "queue is full (capacity: {})", capacity),
            QueueError::ProtocolViolation(msg) => write!(f, "queue protocol violation: {}", msg),
            QueueError::Serialization(err) => write!(f, "item serialization error: {}", err),
            QueueError::Deserialization(err) => write!(f, "item deserialization error: {}", err),
        }
    }
}

impl From<io::Error> for QueueError {
    fn from(err: io::Error) -> Self {
        QueueError::Io(err)
    }
}

/// Item source.
pub trait ItemReader<T> {
    /// Removes and returns the oldest item or [`None`] if there is nothing to read.
    fn read(&mut self) -> Result<Option<T>, QueueError>;
}

/// Item sink.
pub trait ItemWriter<T> {
    /// Appends an item.
    fn write(&mut self, item: T) -> Result<(), QueueError>;

    /// Checks if the sink reached its capacity. Unbounded sinks are never full.
    fn is_full(&self) -> bool {
        false
    }
}

impl<T> ItemWriter<T> for Vec<T> {
    fn write(&mut self, item: T) -> Result<(), QueueError> {
        self.push(item);
        Ok(())
    }
}

/// Base buffered queue interface.
pub trait BufferedQueue<T>: ItemReader<T> + ItemWriter<T> + Send {
    /// Returns the oldest item without consuming it.
    /// The item is kept until the next [`ItemReader::read`] call.
    fn peek(&mut self) -> Result<Option<&T>, QueueError>;

    /// Returns the number of unread items.
    fn len(&self) -> usize;

    /// Returns the queue capacity in items, 0 means unbounded.
    fn capacity(&self) -> usize;

    /// Checks if there are no unread items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards the queue content so that it can be filled again.
    fn reset(&mut self) -> Result<(), QueueError>;

    /// Releases the queue storage. Closing a closed queue is a no-op.
    fn close(&mut self) -> Result<(), QueueError>;
}

/// Queue builder.
pub trait QueueBuilder<T>: Send + Sync {
    /// Creates a new queue holding at most `capacity` items (0 means unbounded).
    fn build(&self, capacity: usize) -> Result<Box<dyn BufferedQueue<T>>, QueueError>;
}

/// Permanently empty queue. Used to pad funnel leaves.
///
/// Like any unbounded queue it is never full, yet every write is rejected.
pub struct EmptyQueue<T> {
    item_type: PhantomData<fn() -> T>,
}

impl<T> EmptyQueue<T> {
    pub fn new() -> Self {
        EmptyQueue { item_type: PhantomData }
    }
}

impl<T> Default for EmptyQueue<T> {
    fn default() -> Self {
        EmptyQueue::new()
    }
}

impl<T> ItemReader<T> for EmptyQueue<T> {
    fn read(&mut self) -> Result<Option<T>, QueueError> {
        Ok(None)
    }
}

impl<T> ItemWriter<T> for EmptyQueue<T> {
    fn write(&mut self, _item: T) -> Result<(), QueueError> {
        Err(QueueError::ProtocolViolation("write to a permanently empty queue"))
    }

    fn is_full(&self) -> bool {
        false
    }
}

impl<T> BufferedQueue<T> for EmptyQueue<T> {
    fn peek(&mut self) -> Result<Option<&T>, QueueError> {
        Ok(None)
    }

    fn len(&self) -> usize {
        0
    }

    fn capacity(&self) -> usize {
        0
    }

    fn reset(&mut self) -> Result<(), QueueError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), QueueError> {
        Ok(())
    }
}
