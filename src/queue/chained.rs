//! Chained multi-segment queue.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::item::{self, Item, ItemFactory, DEFAULT_MAX_ITEM_LENGTH};
use crate::queue::serial::SerialQueue;
use crate::queue::storage::{HeapStorage, MappedStorage, Storage};
use crate::queue::{BufferedQueue, ItemReader, ItemWriter, QueueBuilder, QueueError};

/// Default segment size limit in bytes.
pub const DEFAULT_SEGMENT_SIZE: usize = 1 << 28;

/// Storage of a single chain segment.
pub enum SegmentStorage {
    Heap(HeapStorage),
    Mapped(MappedStorage),
}

impl Storage for SegmentStorage {
    fn len(&self) -> usize {
        match self {
            SegmentStorage::Heap(storage) => storage.len(),
            SegmentStorage::Mapped(storage) => storage.len(),
        }
    }

    fn grow(&mut self, len: usize) -> io::Result<()> {
        match self {
            SegmentStorage::Heap(storage) => storage.grow(len),
            SegmentStorage::Mapped(storage) => storage.grow(len),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            SegmentStorage::Heap(storage) => storage.bytes(),
            SegmentStorage::Mapped(storage) => storage.bytes(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            SegmentStorage::Heap(storage) => storage.bytes_mut(),
            SegmentStorage::Mapped(storage) => storage.bytes_mut(),
        }
    }

    fn release(&mut self) -> io::Result<()> {
        match self {
            SegmentStorage::Heap(storage) => storage.release(),
            SegmentStorage::Mapped(storage) => storage.release(),
        }
    }
}

type Segment<T> = SerialQueue<T, SegmentStorage>;

/// [`ChainedQueue`] builder.
pub struct ChainedQueueBuilder<T> {
    factory: Arc<dyn ItemFactory<T>>,
    max_item_len: usize,
    segment_size: usize,
    memory_segments: usize,
    tmp_dir: Option<PathBuf>,
}

impl<T> Clone for ChainedQueueBuilder<T> {
    fn clone(&self) -> Self {
        ChainedQueueBuilder {
            factory: self.factory.clone(),
            max_item_len: self.max_item_len,
            segment_size: self.segment_size,
            memory_segments: self.memory_segments,
            tmp_dir: self.tmp_dir.clone(),
        }
    }
}

impl<T> ChainedQueueBuilder<T> {
    /// Creates a builder of chains made of heap segments only.
    pub fn new(factory: Arc<dyn ItemFactory<T>>) -> Self {
        ChainedQueueBuilder {
            factory,
            max_item_len: DEFAULT_MAX_ITEM_LENGTH,
            segment_size: DEFAULT_SEGMENT_SIZE,
            memory_segments: usize::MAX,
            tmp_dir: None,
        }
    }

    /// Sets the maximum serialized record length.
    pub fn with_max_item_len(mut self, max_item_len: usize) -> Self {
        self.max_item_len = max_item_len;
        return self;
    }

    /// Sets the segment size limit in bytes.
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        return self;
    }

    /// Makes the chain spill to memory-mapped scratch files placed in `dir` once `memory_segments` heap
    /// segments have been allocated.
    pub fn with_spill(mut self, dir: &Path, memory_segments: usize) -> Self {
        self.tmp_dir = Some(dir.to_path_buf());
        self.memory_segments = memory_segments;
        return self;
    }

    fn new_segment(&self, ordinal: usize) -> Result<Segment<T>, QueueError> {
        let storage = match &self.tmp_dir {
            Some(dir) if ordinal >= self.memory_segments => {
                log::trace!("spilling chain segment {} to {}", ordinal, dir.display());
                SegmentStorage::Mapped(MappedStorage::new(dir)?)
            }
            _ => SegmentStorage::Heap(HeapStorage::new()),
        };
        let segment = SerialQueue::with_storage(self.factory.clone(), storage, 0)
            .with_max_item_len(self.max_item_len)
            .with_max_bytes(self.segment_size);

        return Ok(segment);
    }
}

impl<T: Item> QueueBuilder<T> for ChainedQueueBuilder<T> {
    fn build(&self, capacity: usize) -> Result<Box<dyn BufferedQueue<T>>, QueueError> {
        Ok(Box::new(ChainedQueue::new(self.clone(), capacity)?))
    }
}

/// Queue made of a chain of bounded segments.
///
/// Writes go to the newest segment until a record does not fit in its remaining room, then a new segment is
/// started. Reads drain the oldest segment, which is closed and dropped once empty. A chain can therefore hold
/// far more data than a single segment while no segment ever exceeds the segment size.
pub struct ChainedQueue<T> {
    layout: ChainedQueueBuilder<T>,
    capacity: usize,
    unread: usize,
    segments: VecDeque<Segment<T>>,
    /// Number of segments allocated so far.
    allocated: usize,
    scratch: Vec<u8>,
    closed: bool,
}

impl<T> ChainedQueue<T> {
    pub fn new(layout: ChainedQueueBuilder<T>, capacity: usize) -> Result<Self, QueueError> {
        if layout.segment_size < layout.max_item_len {
            return Err(QueueError::ItemTooLarge {
                len: layout.max_item_len,
                limit: layout.segment_size,
            });
        }

        return Ok(ChainedQueue {
            layout,
            capacity,
            unread: 0,
            segments: VecDeque::new(),
            allocated: 0,
            scratch: Vec::new(),
            closed: false,
        });
    }

    /// Returns the number of live segments.
    pub fn segments(&self) -> usize {
        self.segments.len()
    }
}

impl<T: Item> ChainedQueue<T> {
    fn append(&mut self, record: &[u8]) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::ProtocolViolation("write to a closed queue"));
        }
        if self.capacity != 0 && self.unread >= self.capacity {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }
        if record.len() > self.layout.max_item_len {
            return Err(QueueError::ItemTooLarge {
                len: record.len(),
                limit: self.layout.max_item_len,
            });
        }

        let fits = match self.segments.back() {
            Some(segment) => segment.is_empty() || segment.used_bytes() + record.len() <= self.layout.segment_size,
            None => false,
        };
        if !fits {
            let segment = self.layout.new_segment(self.allocated)?;
            self.allocated += 1;
            self.segments.push_back(segment);
        }

        match self.segments.back_mut() {
            Some(segment) => segment.write_record(record)?,
            None => return Err(QueueError::ProtocolViolation("chain has no segment to write to")),
        }
        self.unread += 1;

        return Ok(());
    }

    /// Returns the oldest segment holding unread items, dropping drained segments in front of it.
    fn front(&mut self) -> Result<Option<&mut Segment<T>>, QueueError> {
        while self.segments.len() > 1 && self.segments.front().map_or(false, |segment| segment.is_empty()) {
            if let Some(mut segment) = self.segments.pop_front() {
                segment.close()?;
            }
        }
        Ok(self.segments.front_mut())
    }
}

impl<T: Item> ItemWriter<T> for ChainedQueue<T> {
    fn write(&mut self, item: T) -> Result<(), QueueError> {
        let mut record = mem::take(&mut self.scratch);
        record.clear();

        let result = item::encode_record(&item, &mut record).and_then(|_| self.append(&record));
        self.scratch = record;

        return result;
    }

    fn is_full(&self) -> bool {
        self.capacity != 0 && self.unread >= self.capacity
    }
}

impl<T: Item> ItemReader<T> for ChainedQueue<T> {
    fn read(&mut self) -> Result<Option<T>, QueueError> {
        if self.unread == 0 {
            return Ok(None);
        }
        let item = match self.front()? {
            Some(segment) => segment.read()?,
            None => None,
        };
        if item.is_some() {
            self.unread -= 1;
        }

        return Ok(item);
    }
}

impl<T: Item> BufferedQueue<T> for ChainedQueue<T> {
    fn peek(&mut self) -> Result<Option<&T>, QueueError> {
        if self.unread == 0 {
            return Ok(None);
        }
        match self.front()? {
            Some(segment) => segment.peek(),
            None => Ok(None),
        }
    }

    fn len(&self) -> usize {
        self.unread
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::ProtocolViolation("reset of a closed queue"));
        }
        while self.segments.len() > 1 {
            if let Some(mut segment) = self.segments.pop_back() {
                segment.close()?;
            }
        }
        if let Some(segment) = self.segments.front_mut() {
            segment.reset()?;
        }
        self.unread = 0;

        return Ok(());
    }

    fn close(&mut self) -> Result<(), QueueError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.unread = 0;

        let mut result = Ok(());
        for mut segment in self.segments.drain(..) {
            if let Err(err) = segment.close() {
                result = Err(err);
            }
        }
        return result;
    }
}
