//! Chunks collecting input items before they are sorted in memory and stored as runs.

use rayon;

use crate::item::{self, Item};

/// Default number of items a chunk holds.
pub const DEFAULT_CHUNK_LEN: usize = 1 << 16;

/// Chunk buffer builder.
pub trait ChunkBufferBuilder<T: Item>: Default {
    type Buffer: ChunkBuffer<T>;

    /// Creates a new empty chunk.
    fn build(&self) -> Self::Buffer;
}

/// Chunk buffer.
///
/// The sorter pushes input items until the chunk is full, sorts it in parallel and writes it out as a run.
pub trait ChunkBuffer<T: Item>: IntoIterator<Item = T> + rayon::slice::ParallelSliceMut<T> + Send {
    fn push(&mut self, item: T);

    /// Returns the number of items in the chunk.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of bytes the chunk takes once serialized into a run, if it is tracked.
    fn run_bytes(&self) -> Option<usize> {
        None
    }

    fn is_full(&self) -> bool;
}

/// What bounds a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    Items(usize),
    RunBytes(usize),
}

/// Sortable chunk of items.
pub struct Chunk<T> {
    items: Vec<T>,
    limit: Limit,
    /// Serialized size of the items, tracked for byte limited chunks only.
    run_bytes: usize,
    scratch: Vec<u8>,
}

impl<T> Chunk<T> {
    fn new(limit: Limit, capacity: usize) -> Self {
        Chunk {
            items: Vec::with_capacity(capacity),
            limit,
            run_bytes: 0,
            scratch: Vec::new(),
        }
    }
}

impl<T: Item> Chunk<T> {
    /// Returns the framed record length of the item.
    /// Items that cannot be serialized count as a bare header, writing them into the run reports the error.
    fn record_len(&mut self, item: &T) -> usize {
        self.scratch.clear();
        match item::encode_record(item, &mut self.scratch) {
            Ok(()) => self.scratch.len(),
            Err(_) => item::HEADER_LEN,
        }
    }
}

impl<T: Item> ChunkBuffer<T> for Chunk<T> {
    fn push(&mut self, item: T) {
        if let Limit::RunBytes(_) = self.limit {
            self.run_bytes += self.record_len(&item);
        }
        self.items.push(item);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn run_bytes(&self) -> Option<usize> {
        match self.limit {
            Limit::Items(_) => None,
            Limit::RunBytes(_) => Some(self.run_bytes),
        }
    }

    fn is_full(&self) -> bool {
        match self.limit {
            Limit::Items(limit) => self.items.len() >= limit,
            Limit::RunBytes(limit) => self.run_bytes >= limit,
        }
    }
}

impl<T> IntoIterator for Chunk<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<T: Send> rayon::slice::ParallelSliceMut<T> for Chunk<T> {
    fn as_parallel_slice_mut(&mut self) -> &mut [T] {
        &mut self.items
    }
}

/// Builder of chunks holding a fixed number of items.
#[derive(Debug, Clone)]
pub struct LimitedBufferBuilder {
    items: usize,
    preallocate: bool,
}

impl LimitedBufferBuilder {
    /// # Arguments
    /// * `items` - Maximum number of items in a chunk
    /// * `preallocate` - Allocate the whole chunk up front
    pub fn new(items: usize, preallocate: bool) -> Self {
        LimitedBufferBuilder {
            items: items.max(1),
            preallocate,
        }
    }

    pub fn limit(&self) -> usize {
        self.items
    }
}

impl Default for LimitedBufferBuilder {
    fn default() -> Self {
        LimitedBufferBuilder::new(DEFAULT_CHUNK_LEN, false)
    }
}

impl<T: Item> ChunkBufferBuilder<T> for LimitedBufferBuilder {
    type Buffer = Chunk<T>;

    fn build(&self) -> Chunk<T> {
        let capacity = if self.preallocate { self.items } else { 0 };
        Chunk::new(Limit::Items(self.items), capacity)
    }
}

/// Builder of chunks bounded by the size of the run they produce.
///
/// Every pushed item is serialized once to measure its record, so a chunk closes as soon as its run would take
/// `run_bytes` bytes. Useful when item values vary a lot in size.
#[derive(Debug, Clone)]
pub struct RunBytesBufferBuilder {
    run_bytes: usize,
}

impl RunBytesBufferBuilder {
    pub fn new(run_bytes: usize) -> Self {
        RunBytesBufferBuilder {
            run_bytes: run_bytes.max(1),
        }
    }
}

impl Default for RunBytesBufferBuilder {
    fn default() -> Self {
        RunBytesBufferBuilder::new(64 << 20)
    }
}

impl<T: Item> ChunkBufferBuilder<T> for RunBytesBufferBuilder {
    type Buffer = Chunk<T>;

    fn build(&self) -> Chunk<T> {
        Chunk::new(Limit::RunBytes(self.run_bytes), 0)
    }
}
