//! External sorter.

use log;
use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::iter;
use std::marker::PhantomData;
use std::panic;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use rayon::slice::ParallelSliceMut;

use crate::chunk::{ChunkBuffer, ChunkBufferBuilder, LimitedBufferBuilder};
use crate::funnel::Funnel;
use crate::item::{Item, ItemFactory, DEFAULT_MAX_ITEM_LENGTH};
use crate::queue::chained::DEFAULT_SEGMENT_SIZE;
use crate::queue::{
    BufferedQueue, ChainedQueueBuilder, ChannelQueue, EmptyQueue, ItemReader, ItemWriter, QueueBuilder, QueueError,
};

/// Default number of runs merged by the first merge pass.
pub const DEFAULT_FAN_IN: usize = 1 << 8;

/// Sorting error.
#[derive(Debug)]
pub enum SortError<E: Error> {
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Run or merge buffer error.
    Queue(QueueError),
    /// Input data stream error
    InputError(E),
}

impl<E> Error for SortError<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            SortError::TempDir(err) => err,
            SortError::ThreadPoolBuildError(err) => err,
            SortError::Queue(err) => err,
            SortError::InputError(err) => err,
        })
    }
}

impl<E: Error> Display for SortError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Queue(err) => write!(f, "run processing failed: {}", err),
            SortError::InputError(err) => write!(f, "input data stream error: {}", err),
        }
    }
}

impl<E: Error> From<QueueError> for SortError<E> {
    fn from(err: QueueError) -> Self {
        SortError::Queue(err)
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
pub struct ExternalSorterBuilder<T, E, B = LimitedBufferBuilder>
where
    T: Item,
    E: Error,
    B: ChunkBufferBuilder<T>,
{
    /// Factory rebuilding items from their serialized form.
    factory: Arc<dyn ItemFactory<T>>,
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Number of runs merged by the first pass.
    fan_in: usize,
    /// Run segment size limit in bytes.
    segment_size: usize,
    /// Number of run segments kept in memory before spilling to disk.
    memory_segments: usize,
    /// Serialized item length limit in bytes.
    max_item_len: usize,
    /// Read-ahead queue capacity.
    read_ahead: Option<usize>,

    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<T, E, B> ExternalSorterBuilder<T, E, B>
where
    T: Item,
    E: Error,
    B: ChunkBufferBuilder<T>,
{
    /// Creates an instance of a builder with default parameters.
    ///
    /// # Arguments
    /// * `factory` - Factory rebuilding items from their serialized form
    pub fn new(factory: impl ItemFactory<T> + 'static) -> Self {
        ExternalSorterBuilder {
            factory: Arc::new(factory),
            threads_number: None,
            tmp_dir: None,
            buffer_builder: B::default(),
            fan_in: DEFAULT_FAN_IN,
            segment_size: DEFAULT_SEGMENT_SIZE,
            memory_segments: 0,
            max_item_len: DEFAULT_MAX_ITEM_LENGTH,
            read_ahead: None,
            input_error_type: PhantomData,
        }
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<T, E, B>, SortError<E>> {
        ExternalSorter::new(self)
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<T, E, B> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<T, E, B> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets buffer builder.
    pub fn with_buffer(mut self, buffer_builder: B) -> ExternalSorterBuilder<T, E, B> {
        self.buffer_builder = buffer_builder;
        return self;
    }

    /// Sets number of runs merged by the first merge pass. Every following pass merges that many runs more.
    pub fn with_fan_in(mut self, fan_in: usize) -> ExternalSorterBuilder<T, E, B> {
        self.fan_in = fan_in.max(2);
        return self;
    }

    /// Sets run segment size limit in bytes.
    pub fn with_segment_size(mut self, segment_size: usize) -> ExternalSorterBuilder<T, E, B> {
        self.segment_size = segment_size;
        return self;
    }

    /// Sets number of segments a run keeps in memory before the rest of it spills to the temporary directory.
    pub fn with_memory_segments(mut self, memory_segments: usize) -> ExternalSorterBuilder<T, E, B> {
        self.memory_segments = memory_segments;
        return self;
    }

    /// Sets serialized item length limit in bytes, record header included.
    pub fn with_max_item_len(mut self, max_item_len: usize) -> ExternalSorterBuilder<T, E, B> {
        self.max_item_len = max_item_len;
        return self;
    }

    /// Makes the sorter consume its input in a separate thread.
    /// At most `capacity` items are read ahead of the sorter.
    pub fn with_read_ahead(mut self, capacity: usize) -> ExternalSorterBuilder<T, E, B> {
        self.read_ahead = Some(capacity);
        return self;
    }
}

/// External sorter.
///
/// Input items are collected into chunks, every chunk is sorted in memory and stored as a run. Runs are merged
/// by funnels in passes: once the number of runs reaches the pass fan-in they are merged into a single run which
/// becomes the first run of the next pass. The last pass merges whatever runs are left.
pub struct ExternalSorter<T, E, B = LimitedBufferBuilder>
where
    T: Item,
    E: Error,
    B: ChunkBufferBuilder<T>,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
    /// Chunk buffer builder.
    buffer_builder: B,
    /// Builder of runs.
    runs: ChainedQueueBuilder<T>,
    /// Builder of funnel internal buffers.
    funnel_buffers: ChainedQueueBuilder<T>,
    /// Number of runs merged by the first pass.
    fan_in: usize,
    /// Read-ahead queue capacity.
    read_ahead: Option<usize>,

    /// Input error type.
    input_error_type: PhantomData<E>,
}

impl<T, E, B> ExternalSorter<T, E, B>
where
    T: Item,
    E: Error,
    B: ChunkBufferBuilder<T>,
{
    /// Creates a new external sorter instance.
    pub fn new(builder: ExternalSorterBuilder<T, E, B>) -> Result<Self, SortError<E>> {
        if builder.segment_size < builder.max_item_len {
            return Err(SortError::Queue(QueueError::ItemTooLarge {
                len: builder.max_item_len,
                limit: builder.segment_size,
            }));
        }

        let thread_pool = Self::init_thread_pool(builder.threads_number)?;
        let tmp_dir = Self::init_tmp_directory(builder.tmp_dir.as_deref())?;

        let funnel_buffers = ChainedQueueBuilder::new(builder.factory)
            .with_max_item_len(builder.max_item_len)
            .with_segment_size(builder.segment_size);
        let runs = funnel_buffers
            .clone()
            .with_spill(tmp_dir.path(), builder.memory_segments);

        return Ok(ExternalSorter {
            thread_pool,
            tmp_dir,
            buffer_builder: builder.buffer_builder,
            runs,
            funnel_buffers,
            fan_in: builder.fan_in,
            read_ahead: builder.read_ahead,
            input_error_type: PhantomData,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError<E>> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError<E>> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    /// Returns the directory runs spill to.
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Sorts data from the input.
    /// Returns an iterator that can be used to get sorted data stream.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    pub fn sort<I>(&self, input: I) -> Result<SortedRun<'_, T>, SortError<E>>
    where
        T: Ord,
        E: Send,
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send,
    {
        self.sort_by(input, T::cmp)
    }

    /// Sorts data from the input using a custom compare function.
    /// Returns an iterator that can be used to get sorted data stream.
    ///
    /// Nothing is returned until every merge pass succeeded: the last pass merges into a run that is handed out
    /// afterwards, so the sorted data is written and read once more instead of being merged straight into the
    /// caller's output. Items comparing equal are all kept but their relative order is unspecified.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `compare` - Function be be used to compare items
    pub fn sort_by<I, F>(&self, input: I, compare: F) -> Result<SortedRun<'_, T>, SortError<E>>
    where
        E: Send,
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        let run = match self.read_ahead {
            Some(capacity) => self.sort_read_ahead(input.into_iter(), capacity, compare)?,
            None => self.sort_stream(input.into_iter().map(|item| item.map_err(SortError::InputError)), compare)?,
        };

        log::debug!("external sort done ({} items)", run.len());

        return Ok(SortedRun::new(run));
    }

    fn sort_read_ahead<I, F>(
        &self,
        input: I,
        capacity: usize,
        compare: F,
    ) -> Result<Box<dyn BufferedQueue<T>>, SortError<E>>
    where
        E: Send,
        I: Iterator<Item = Result<T, E>> + Send,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        let mut queue = ChannelQueue::new(capacity);
        let mut writer = queue
            .take_writer()
            .ok_or(SortError::Queue(QueueError::ProtocolViolation("read-ahead writer is taken")))?;

        log::debug!("starting read-ahead (capacity: {})", capacity);

        thread::scope(|scope| {
            let producer = scope.spawn(move || -> Result<(), Feed<E>> {
                for item in input {
                    writer.write(item.map_err(Feed::Input)?).map_err(Feed::Queue)?;
                }
                writer.close();
                Ok(())
            });

            let consumed = iter::from_fn(|| queue.read().map_err(SortError::Queue).transpose());
            let sorted = self.sort_stream(consumed, compare);
            // unblocks the producer if the sort stopped early
            let closed = queue.close();

            let fed = match producer.join() {
                Ok(fed) => fed,
                Err(payload) => panic::resume_unwind(payload),
            };

            match (fed, sorted) {
                (Err(Feed::Input(err)), sorted) => {
                    if let Ok(mut run) = sorted {
                        discard(run.as_mut());
                    }
                    Err(SortError::InputError(err))
                }
                (_, Err(err)) => Err(err),
                (Err(Feed::Queue(err)), Ok(mut run)) => {
                    discard(run.as_mut());
                    Err(SortError::Queue(err))
                }
                (Ok(()), Ok(mut run)) => match closed {
                    Ok(()) => Ok(run),
                    Err(err) => {
                        discard(run.as_mut());
                        Err(SortError::Queue(err))
                    }
                },
            }
        })
    }

    fn sort_stream<I, F>(&self, input: I, compare: F) -> Result<Box<dyn BufferedQueue<T>>, SortError<E>>
    where
        I: Iterator<Item = Result<T, SortError<E>>>,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        let mut runs = Vec::new();
        let result = self.merge_passes(input, compare, &mut runs);
        if result.is_err() {
            for run in runs.iter_mut() {
                discard(run.as_mut());
            }
        }

        return result;
    }

    fn merge_passes<I, F>(
        &self,
        input: I,
        compare: F,
        runs: &mut Vec<Box<dyn BufferedQueue<T>>>,
    ) -> Result<Box<dyn BufferedQueue<T>>, SortError<E>>
    where
        I: Iterator<Item = Result<T, SortError<E>>>,
        F: Fn(&T, &T) -> Ordering + Sync + Send + Copy,
    {
        let mut fan_in = self.fan_in;
        let mut pass = 0;
        let mut chunk_buf = self.buffer_builder.build();

        for item in input {
            chunk_buf.push(item?);

            if !chunk_buf.is_full() {
                continue;
            }
            let chunk = std::mem::replace(&mut chunk_buf, self.buffer_builder.build());
            runs.push(self.create_run(chunk, compare)?);

            if runs.len() >= fan_in {
                pass += 1;
                log::info!("merge pass {} (runs: {}, fan-in: {})", pass, runs.len(), fan_in);

                let merged = self.merge(runs, compare)?;
                runs.push(merged);
                fan_in += self.fan_in;
            }
        }

        if !chunk_buf.is_empty() {
            runs.push(self.create_run(chunk_buf, compare)?);
        }

        log::debug!("external sort preparation done (runs: {})", runs.len());

        return match runs.pop() {
            None => Ok(self.runs.build(0)?),
            Some(run) if runs.is_empty() => Ok(run),
            Some(run) => {
                runs.push(run);
                log::info!("final merge pass (runs: {})", runs.len());
                self.merge(runs, compare)
            }
        };
    }

    fn create_run<F>(&self, mut buffer: B::Buffer, compare: F) -> Result<Box<dyn BufferedQueue<T>>, SortError<E>>
    where
        F: Fn(&T, &T) -> Ordering + Sync + Send,
    {
        match buffer.run_bytes() {
            Some(bytes) => log::debug!("sorting chunk data ({} items, {} bytes) ...", buffer.len(), bytes),
            None => log::debug!("sorting chunk data ({} items) ...", buffer.len()),
        }
        self.thread_pool.install(|| {
            buffer.par_sort_by(compare);
        });

        log::debug!("saving chunk data");
        let mut run = self.runs.build(0)?;
        for item in buffer {
            if let Err(err) = run.write(item) {
                discard(run.as_mut());
                return Err(SortError::Queue(err));
            }
        }

        return Ok(run);
    }

    /// Merges all the runs into a new one. The merged runs are closed and removed.
    fn merge<F>(
        &self,
        runs: &mut Vec<Box<dyn BufferedQueue<T>>>,
        compare: F,
    ) -> Result<Box<dyn BufferedQueue<T>>, SortError<E>>
    where
        F: Fn(&T, &T) -> Ordering + Copy,
    {
        let mut funnel = Funnel::with_fan_in(runs.len(), &self.funnel_buffers)?;
        runs.resize_with(funnel.k(), || -> Box<dyn BufferedQueue<T>> { Box::new(EmptyQueue::new()) });

        let mut merged = self.runs.build(0)?;
        let mut result = funnel.fill(runs.as_mut_slice(), merged.as_mut(), compare);
        result = result.and(funnel.close());
        for mut run in runs.drain(..) {
            result = result.and(run.close());
        }

        if let Err(err) = result {
            discard(merged.as_mut());
            return Err(SortError::Queue(err));
        }
        log::debug!("runs merged (items: {}, funnel height: {})", merged.len(), funnel.height());

        return Ok(merged);
    }
}

/// Read-ahead producer failure.
enum Feed<E> {
    Input(E),
    Queue(QueueError),
}

/// Closes a queue that is no longer needed.
fn discard<T>(queue: &mut dyn BufferedQueue<T>) {
    if let Err(err) = queue.close() {
        log::warn!("queue closing failed: {}", err);
    }
}

/// Sorted output of an [`ExternalSorter`].
///
/// Yields the items in sorted order. The run storage is released once the run is drained or dropped. A read
/// error is yielded once and ends the run.
pub struct SortedRun<'a, T> {
    queue: Box<dyn BufferedQueue<T>>,
    closed: bool,
    sorter: PhantomData<&'a ()>,
}

impl<'a, T> SortedRun<'a, T> {
    fn new(queue: Box<dyn BufferedQueue<T>>) -> Self {
        SortedRun {
            queue,
            closed: false,
            sorter: PhantomData,
        }
    }

    /// Returns the number of items left.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Writes all the items left into the writer and releases the run.
    pub fn write_to<W>(mut self, writer: &mut W) -> Result<(), QueueError>
    where
        W: ItemWriter<T> + ?Sized,
    {
        while let Some(item) = self.queue.read()? {
            writer.write(item)?;
        }
        return self.close();
    }

    /// Releases the run storage. Items not read yet are lost.
    pub fn close(&mut self) -> Result<(), QueueError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.queue.close()
    }
}

impl<'a, T> Iterator for SortedRun<'a, T> {
    type Item = Result<T, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }

        match self.queue.read() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => self.close().err().map(Err),
            Err(err) => {
                // the run cannot be read past a broken record
                if let Err(close_err) = self.close() {
                    log::warn!("sorted run closing failed: {}", close_err);
                }
                Some(Err(err))
            }
        }
    }
}

impl<'a, T> Drop for SortedRun<'a, T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("sorted run closing failed: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;
    use std::path::Path;

    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, SortError};
    use crate::chunk::LimitedBufferBuilder;
    use crate::item::{decode_record, ItemFactory, Keyed, Record, RecordFactory, RmpFactory};
    use crate::queue::QueueError;

    /// Fails to rebuild records with the given key.
    struct BrokenFactory {
        broken_key: i64,
    }

    impl ItemFactory<Record> for BrokenFactory {
        fn new_item(&self, bytes: &[u8]) -> Result<Record, QueueError> {
            let (key, value) = decode_record(bytes)?;
            if key == self.broken_key {
                return Err(QueueError::Deserialization("broken record".into()));
            }
            Ok(Record::new(key, value))
        }
    }

    fn records(keys: impl IntoIterator<Item = i64>) -> Vec<Result<Record, io::Error>> {
        Vec::from_iter(keys.into_iter().map(|key| Ok(Record::key_only(key))))
    }

    fn keys(result: super::SortedRun<'_, Record>) -> Vec<i64> {
        let actual_result: Result<Vec<Record>, _> = result.collect();
        Vec::from_iter(actual_result.unwrap().into_iter().map(|record| record.key))
    }

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter(#[case] reversed: bool) {
        let input_sorted = 0..100;

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());

        let input = records(input_shuffled);

        let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_buffer(LimitedBufferBuilder::new(8, true))
            .with_threads_number(2)
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let compare = if reversed {
            |a: &Record, b: &Record| a.cmp(b).reverse()
        } else {
            |a: &Record, b: &Record| a.cmp(b)
        };

        let result = sorter.sort_by(input, compare).unwrap();

        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(keys(result), expected_result)
    }

    #[rstest]
    #[case(vec![5, 3, 8, 1], vec![1, 3, 5, 8])]
    #[case(vec![], vec![])]
    #[case(vec![42], vec![42])]
    #[case(vec![2, 2, -7, 2], vec![-7, 2, 2, 2])]
    fn test_small_inputs(#[case] input: Vec<i64>, #[case] expected: Vec<i64>) {
        let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_buffer(LimitedBufferBuilder::new(2, false))
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let result = sorter.sort(records(input)).unwrap();
        assert_eq!(result.len(), expected.len());
        assert_eq!(keys(result), expected);
        assert_eq!(count_files(sorter.tmp_dir()), 0);
    }

    #[test]
    fn test_random_keys() {
        let mut rng = StdRng::seed_from_u64(1);
        let input = Vec::from_iter((0..1 << 16).map(|_| rng.gen::<i64>()));

        let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_buffer(LimitedBufferBuilder::new(1 << 8, true))
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let result = sorter.sort(records(input.clone())).unwrap();

        let mut expected = input;
        expected.sort();
        assert_eq!(keys(result), expected);
    }

    #[rstest]
    #[case(4, 2, 0)]
    #[case(7, 3, 1)]
    #[case(16, 5, usize::MAX)]
    fn test_multi_pass(#[case] chunk_len: usize, #[case] fan_in: usize, #[case] memory_segments: usize) {
        let mut rng = StdRng::seed_from_u64(chunk_len as u64);
        let input = Vec::from_iter((0..500).map(|_| {
            let key = rng.gen_range(0..50);
            let value = Vec::from_iter((0..rng.gen_range(0..8)).map(|_| rng.gen::<u8>()));
            Record::new(key, value)
        }));

        let single_pass: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_buffer(LimitedBufferBuilder::new(1000, false))
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();
        let multi_pass: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_buffer(LimitedBufferBuilder::new(chunk_len, false))
            .with_fan_in(fan_in)
            .with_max_item_len(64)
            .with_segment_size(256)
            .with_memory_segments(memory_segments)
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let expected: Vec<Record> = single_pass
            .sort(Vec::from_iter(input.iter().cloned().map(Ok)))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        let actual: Vec<Record> = multi_pass
            .sort(Vec::from_iter(input.into_iter().map(Ok)))
            .unwrap()
            .map(Result::unwrap)
            .collect();

        assert_eq!(actual, expected);
        assert!(actual.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(count_files(multi_pass.tmp_dir()), 0);
    }

    #[rstest]
    #[case(1)]
    #[case(64)]
    #[case(0)]
    fn test_read_ahead(#[case] capacity: usize) {
        let mut input_shuffled = Vec::from_iter(0..1000);
        input_shuffled.shuffle(&mut rand::thread_rng());

        let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_buffer(LimitedBufferBuilder::new(16, true))
            .with_fan_in(4)
            .with_read_ahead(capacity)
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let result = sorter.sort(records(input_shuffled)).unwrap();
        assert_eq!(keys(result), Vec::from_iter(0..1000));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(1))]
    #[case(Some(8))]
    fn test_input_error(#[case] read_ahead: Option<usize>) {
        let mut input = records(0..100);
        input.insert(50, Err(io::Error::new(io::ErrorKind::InvalidData, "broken line")));

        let mut builder: ExternalSorterBuilder<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_buffer(LimitedBufferBuilder::new(8, true))
            .with_tmp_dir(Path::new("./"));
        if let Some(capacity) = read_ahead {
            builder = builder.with_read_ahead(capacity);
        }
        let sorter = builder.build().unwrap();

        let result = sorter.sort(input);
        match result {
            Err(SortError::InputError(err)) => assert_eq!(err.kind(), io::ErrorKind::InvalidData),
            _ => panic!("input error expected"),
        }
        assert_eq!(count_files(sorter.tmp_dir()), 0);
    }

    #[test]
    fn test_item_too_large() {
        let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
            .with_max_item_len(32)
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let input = vec![Ok(Record::key_only(1)), Ok(Record::new(2, vec![0u8; 64]))];
        let result = sorter.sort(input);

        assert!(matches!(
            result,
            Err(SortError::Queue(QueueError::ItemTooLarge { len: 76, limit: 32 }))
        ));
    }

    #[test]
    fn test_invalid_segment_size() {
        let result: Result<ExternalSorter<Record, io::Error>, _> = ExternalSorterBuilder::new(RecordFactory)
            .with_max_item_len(128)
            .with_segment_size(64)
            .build();

        assert!(matches!(result, Err(SortError::Queue(QueueError::ItemTooLarge { .. }))));
    }

    #[test]
    fn test_keyed_values() {
        let mut input = Vec::from_iter((0..200).map(|key| Keyed::new(key % 17, format!("value-{}", key))));
        input.shuffle(&mut rand::thread_rng());

        let sorter: ExternalSorter<Keyed<String>, io::Error> = ExternalSorterBuilder::new(RmpFactory::new())
            .with_buffer(LimitedBufferBuilder::new(10, false))
            .with_fan_in(3)
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let mut result = Vec::new();
        sorter
            .sort(Vec::from_iter(input.iter().cloned().map(Ok)))
            .unwrap()
            .write_to(&mut result)
            .unwrap();

        let mut expected = input;
        expected.sort();
        assert_eq!(result, expected);
    }

    #[test]
    fn test_read_error_ends_run() {
        let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(BrokenFactory { broken_key: 2 })
            .with_tmp_dir(Path::new("./"))
            .build()
            .unwrap();

        let result = Vec::from_iter(sorter.sort(records(vec![3, 1, 2])).unwrap().take(6));

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].as_ref().unwrap(), &Record::key_only(1));
        assert!(matches!(result[1], Err(QueueError::Deserialization(_))));
        assert_eq!(count_files(sorter.tmp_dir()), 0);
    }
}
