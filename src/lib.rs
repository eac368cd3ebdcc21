//! `funnel-sort` is a rust cache-oblivious external sort implementation.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. The sorter splits the input into chunks that fit
//! in RAM, sorts every chunk and then merges the sorted runs together using funnels (lazy cache-oblivious
//! k-mergers). A funnel performs an asymptotically optimal number of memory transfers on every level of the memory
//! hierarchy without knowing the cache or page sizes. For more information see
//! [Funnelsort](https://en.wikipedia.org/wiki/Funnelsort).
//!
//! # Overview
//!
//! `funnel-sort` supports the following features:
//!
//! * **Keyed records:**
//!   items are sorted as records made of a 64-bit key and an opaque value. The library provides a plain
//!   [`Record`] type and a [`Keyed`] type whose value is any `serde` serializable type stored in `MessagePack`
//!   format. Custom items implement the [`Item`] and [`ItemFactory`] traits.
//! * **Spilling runs:**
//!   sorted runs are stored in chains of bounded segments. The first segments of a run can be kept in memory,
//!   the rest is spilled to memory-mapped scratch files removed as soon as they are consumed.
//! * **Multithreading support:**
//!   chunks are sorted in a thread pool and the input can be consumed in a separate read-ahead thread.
//! * **Multi-pass merging:**
//!   the number of runs merged at once is bounded, runs are merged in passes of a growing fan-in.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io::{self, prelude::*};
//! use std::path;
//!
//! use funnel_sort::{ExternalSorter, ExternalSorterBuilder, LimitedBufferBuilder, Record, RecordFactory};
//!
//! fn main() {
//!     let input_reader = io::BufReader::new(fs::File::open("input.txt").unwrap());
//!     let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());
//!
//!     let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_buffer(LimitedBufferBuilder::new(1_000_000, true))
//!         .build()
//!         .unwrap();
//!
//!     let records = input_reader.lines().map(|line| -> io::Result<Record> {
//!         let line = line?;
//!         let key = line.parse::<i64>().map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
//!         Ok(Record::new(key, line))
//!     });
//!     let sorted = sorter.sort(records).unwrap();
//!
//!     for record in sorted.map(Result::unwrap) {
//!         output_writer.write_all(&record.value).unwrap();
//!         output_writer.write_all(b"\n").unwrap();
//!     }
//!     output_writer.flush().unwrap();
//! }
//! ```

pub mod chunk;
pub mod funnel;
pub mod item;
pub mod queue;
pub mod sort;

pub use chunk::{Chunk, ChunkBuffer, ChunkBufferBuilder, LimitedBufferBuilder, RunBytesBufferBuilder};
pub use funnel::Funnel;
pub use item::{Item, ItemFactory, Keyed, Record, RecordFactory, RmpFactory};
pub use queue::{BufferedQueue, EmptyQueue, ItemReader, ItemWriter, QueueBuilder, QueueError};
pub use sort::{ExternalSorter, ExternalSorterBuilder, SortError, SortedRun};
