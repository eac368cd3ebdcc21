//! Serializing queues.

use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::item::{self, Item, ItemFactory, DEFAULT_MAX_ITEM_LENGTH};
use crate::queue::storage::{HeapStorage, MappedStorage, Storage};
use crate::queue::{BufferedQueue, ItemReader, ItemWriter, QueueBuilder, QueueError};

/// Heap backed queue.
pub type MemoryQueue<T> = SerialQueue<T, HeapStorage>;

/// Queue backed by a memory-mapped scratch file.
pub type MappedQueue<T> = SerialQueue<T, MappedStorage>;

/// Queue keeping its items serialized in a byte storage.
///
/// Records are appended at the write cursor and consumed at the read cursor. Both cursors are rewound as soon
/// as the queue is drained, so a queue that is filled and drained repeatedly reuses the same bytes.
pub struct SerialQueue<T, S> {
    factory: Arc<dyn ItemFactory<T>>,
    storage: S,
    /// Maximum number of unread items, 0 means unbounded.
    capacity: usize,
    unread: usize,
    /// Read cursor.
    head: usize,
    /// Write cursor.
    tail: usize,
    max_item_len: usize,
    /// Upper bound of the storage size.
    max_bytes: usize,
    /// Memoized head item along with its serialized length.
    peeked: Option<(T, usize)>,
    scratch: Vec<u8>,
    closed: bool,
}

impl<T> SerialQueue<T, HeapStorage> {
    pub fn new(factory: Arc<dyn ItemFactory<T>>, capacity: usize) -> Self {
        SerialQueue::with_storage(factory, HeapStorage::new(), capacity)
    }
}

impl<T> SerialQueue<T, MappedStorage> {
    /// Creates a queue whose scratch file is placed in the `dir` directory.
    pub fn in_dir(factory: Arc<dyn ItemFactory<T>>, dir: &Path, capacity: usize) -> Result<Self, QueueError> {
        Ok(SerialQueue::with_storage(factory, MappedStorage::new(dir)?, capacity))
    }
}

impl<T, S: Storage> SerialQueue<T, S> {
    pub fn with_storage(factory: Arc<dyn ItemFactory<T>>, storage: S, capacity: usize) -> Self {
        SerialQueue {
            factory,
            storage,
            capacity,
            unread: 0,
            head: 0,
            tail: 0,
            max_item_len: DEFAULT_MAX_ITEM_LENGTH,
            max_bytes: usize::MAX,
            peeked: None,
            scratch: Vec::new(),
            closed: false,
        }
    }

    /// Sets the maximum serialized record length.
    pub fn with_max_item_len(mut self, max_item_len: usize) -> Self {
        self.max_item_len = max_item_len;
        return self;
    }

    /// Caps the storage size in bytes.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        return self;
    }

    /// Returns the number of storage bytes in use, including already consumed records of a non drained queue.
    pub fn used_bytes(&self) -> usize {
        self.tail
    }

    /// Returns the backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Appends an already framed record.
    pub(crate) fn write_record(&mut self, record: &[u8]) -> Result<(), QueueError> {
        if self.closed {
            return Err(QueueError::ProtocolViolation("write to a closed queue"));
        }
        if self.at_capacity() {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }
        if record.len() > self.max_item_len {
            return Err(QueueError::ItemTooLarge {
                len: record.len(),
                limit: self.max_item_len,
            });
        }
        if self.unread == 0 {
            self.head = 0;
            self.tail = 0;
        }

        let end = self.tail + record.len();
        if end > self.max_bytes {
            return Err(QueueError::ItemTooLarge {
                len: record.len(),
                limit: self.max_bytes - self.tail,
            });
        }
        if end > self.storage.len() {
            let grown = (2 * self.storage.len() + record.len()).min(self.max_bytes).max(end);
            self.storage.grow(grown)?;
        }

        self.storage.bytes_mut()[self.tail..end].copy_from_slice(record);
        self.tail = end;
        self.unread += 1;

        return Ok(());
    }

    fn decode_head(&self) -> Result<(T, usize), QueueError> {
        let bytes = self.storage.bytes().get(self.head..self.tail).ok_or_else(|| {
            QueueError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "queue storage lost unread records"))
        })?;
        let len = item::record_len(bytes)?;
        let item = self.factory.new_item(&bytes[..len])?;

        return Ok((item, len));
    }
}

impl<T: Item, S: Storage> ItemWriter<T> for SerialQueue<T, S> {
    fn write(&mut self, item: T) -> Result<(), QueueError> {
        let mut record = mem::take(&mut self.scratch);
        record.clear();

        let result = item::encode_record(&item, &mut record).and_then(|_| self.write_record(&record));
        self.scratch = record;

        return result;
    }

    fn is_full(&self) -> bool {
        self.at_capacity()
    }
}

impl<T: Item, S: Storage> ItemReader<T> for SerialQueue<T, S> {
    fn read(&mut self) -> Result<Option<T>, QueueError> {
        if self.unread == 0 {
            return Ok(None);
        }
        let (item, len) = match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.decode_head()?,
        };

        self.head += len;
        self.unread -= 1;
        if self.unread == 0 {
            self.head = 0;
            self.tail = 0;
        }

        return Ok(Some(item));
    }
}

impl<T: Item, S: Storage> BufferedQueue<T> for SerialQueue<T, S> {
    fn peek(&mut self) -> Result<Option<&T>, QueueError> {
        if self.unread == 0 {
            return Ok(None);
        }
        if self.peeked.is_none() {
            self.peeked = Some(self.decode_head()?);
        }
        Ok(self.peeked.as_ref().map(|(item, _)| item))
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
        self.reset_cursors();
        Ok(())
    }

    fn close(&mut self) -> Result<(), QueueError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.reset_cursors();
        self.storage.release()?;
        Ok(())
    }
}

impl<T, S> SerialQueue<T, S> {
    fn at_capacity(&self) -> bool {
        self.capacity != 0 && self.unread >= self.capacity
    }

    fn reset_cursors(&mut self) {
        self.unread = 0;
        self.head = 0;
        self.tail = 0;
        self.peeked = None;
    }
}

/// [`MemoryQueue`] builder.
pub struct MemoryQueueBuilder<T> {
    factory: Arc<dyn ItemFactory<T>>,
    max_item_len: usize,
}

impl<T> MemoryQueueBuilder<T> {
    pub fn new(factory: Arc<dyn ItemFactory<T>>) -> Self {
        MemoryQueueBuilder {
            factory,
            max_item_len: DEFAULT_MAX_ITEM_LENGTH,
        }
    }

    pub fn with_max_item_len(mut self, max_item_len: usize) -> Self {
        self.max_item_len = max_item_len;
        return self;
    }
}

impl<T: Item> QueueBuilder<T> for MemoryQueueBuilder<T> {
    fn build(&self, capacity: usize) -> Result<Box<dyn BufferedQueue<T>>, QueueError> {
        let queue = MemoryQueue::new(self.factory.clone(), capacity).with_max_item_len(self.max_item_len);
        Ok(Box::new(queue))
    }
}

/// [`MappedQueue`] builder.
pub struct MappedQueueBuilder<T> {
    factory: Arc<dyn ItemFactory<T>>,
    max_item_len: usize,
    dir: PathBuf,
}

impl<T> MappedQueueBuilder<T> {
    /// Creates a builder placing scratch files in the `dir` directory.
    pub fn new(factory: Arc<dyn ItemFactory<T>>, dir: &Path) -> Self {
        MappedQueueBuilder {
            factory,
            max_item_len: DEFAULT_MAX_ITEM_LENGTH,
            dir: dir.to_path_buf(),
        }
    }

    pub fn with_max_item_len(mut self, max_item_len: usize) -> Self {
        self.max_item_len = max_item_len;
        return self;
    }
}

impl<T: Item> QueueBuilder<T> for MappedQueueBuilder<T> {
    fn build(&self, capacity: usize) -> Result<Box<dyn BufferedQueue<T>>, QueueError> {
        let queue = MappedQueue::in_dir(self.factory.clone(), &self.dir, capacity)?.with_max_item_len(self.max_item_len);
        Ok(Box::new(queue))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rstest::*;

    use std::io;

    use super::{MappedQueueBuilder, MemoryQueue, MemoryQueueBuilder, SerialQueue};
    use crate::item::{Record, RecordFactory, HEADER_LEN};
    use crate::queue::storage::{HeapStorage, Storage};
    use crate::queue::{BufferedQueue, ItemReader, ItemWriter, QueueBuilder, QueueError};

    /// Heap storage that loses its content when growing past `limit` bytes, like a mapping that cannot be
    /// restored.
    struct LossyStorage {
        inner: HeapStorage,
        limit: usize,
    }

    impl Storage for LossyStorage {
        fn len(&self) -> usize {
            self.inner.len()
        }

        fn grow(&mut self, len: usize) -> io::Result<()> {
            if len > self.limit {
                self.inner.release()?;
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            self.inner.grow(len)
        }

        fn bytes(&self) -> &[u8] {
            self.inner.bytes()
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            self.inner.bytes_mut()
        }

        fn release(&mut self) -> io::Result<()> {
            self.inner.release()
        }
    }

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn check_fifo(queue: &mut dyn BufferedQueue<Record>) {
        assert!(queue.is_empty());
        assert_eq!(queue.read().unwrap(), None);

        queue.write(Record::new(23, "a")).unwrap();
        queue.write(Record::new(34, "bb")).unwrap();
        queue.write(Record::new(45, "")).unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.peek().unwrap(), Some(&Record::new(23, "a")));
        assert_eq!(queue.peek().unwrap(), Some(&Record::new(23, "a")));
        assert_eq!(queue.read().unwrap(), Some(Record::new(23, "a")));
        assert_eq!(queue.read().unwrap(), Some(Record::new(34, "bb")));

        queue.write(Record::new(56, "cccc")).unwrap();
        assert_eq!(queue.read().unwrap(), Some(Record::new(45, "")));
        assert_eq!(queue.peek().unwrap(), Some(&Record::new(56, "cccc")));
        assert_eq!(queue.read().unwrap(), Some(Record::new(56, "cccc")));

        assert!(queue.is_empty());
        assert_eq!(queue.peek().unwrap(), None);
        assert_eq!(queue.read().unwrap(), None);
    }

    #[test]
    fn test_memory_queue() {
        let builder: MemoryQueueBuilder<Record> = MemoryQueueBuilder::new(Arc::new(RecordFactory));
        let mut queue = builder.build(0).unwrap();

        check_fifo(queue.as_mut());
        queue.close().unwrap();
    }

    #[rstest]
    fn test_mapped_queue(tmp_dir: tempfile::TempDir) {
        let builder: MappedQueueBuilder<Record> = MappedQueueBuilder::new(Arc::new(RecordFactory), tmp_dir.path());
        let mut queue = builder.build(0).unwrap();

        check_fifo(queue.as_mut());

        // forces several remaps
        for key in 0..10_000 {
            queue.write(Record::new(key, vec![key as u8; 100])).unwrap();
        }
        for key in 0..10_000 {
            assert_eq!(queue.read().unwrap(), Some(Record::new(key, vec![key as u8; 100])));
        }

        queue.close().unwrap();
        queue.close().unwrap();
        assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_bounded_queue() {
        let mut queue: MemoryQueue<Record> = MemoryQueue::new(Arc::new(RecordFactory), 2);

        queue.write(Record::key_only(1)).unwrap();
        assert!(!queue.is_full());
        queue.write(Record::key_only(2)).unwrap();
        assert!(queue.is_full());
        assert!(matches!(
            queue.write(Record::key_only(3)),
            Err(QueueError::QueueFull { capacity: 2 })
        ));

        queue.read().unwrap();
        assert!(!queue.is_full());

        queue.reset().unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.read().unwrap(), None);
    }

    #[test]
    fn test_item_too_large() {
        let mut queue: MemoryQueue<Record> = MemoryQueue::new(Arc::new(RecordFactory), 0).with_max_item_len(HEADER_LEN + 4);

        queue.write(Record::new(1, vec![0; 4])).unwrap();
        assert!(matches!(
            queue.write(Record::new(2, vec![0; 5])),
            Err(QueueError::ItemTooLarge { len: 17, limit: 16 })
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_closed_queue() {
        let mut queue: MemoryQueue<Record> = MemoryQueue::new(Arc::new(RecordFactory), 0);
        queue.write(Record::key_only(1)).unwrap();
        queue.close().unwrap();

        assert!(queue.is_empty());
        assert!(matches!(
            queue.write(Record::key_only(2)),
            Err(QueueError::ProtocolViolation(_))
        ));
        assert!(queue.reset().is_err());
    }

    #[test]
    fn test_lost_storage() {
        let storage = LossyStorage {
            inner: HeapStorage::new(),
            limit: 70,
        };
        let mut queue: SerialQueue<Record, LossyStorage> =
            SerialQueue::with_storage(Arc::new(RecordFactory), storage, 0);

        // 20 byte records grow the storage to 20, then 60 bytes, the fourth one needs 140
        for key in 0..3 {
            queue.write(Record::new(key, "abcdefgh")).unwrap();
        }
        assert!(matches!(queue.write(Record::new(3, "abcdefgh")), Err(QueueError::Io(_))));

        assert_eq!(queue.len(), 3);
        assert!(matches!(queue.peek(), Err(QueueError::Io(_))));
        assert!(matches!(queue.read(), Err(QueueError::Io(_))));
        queue.close().unwrap();
    }
}
