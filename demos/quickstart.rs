use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;

use funnel_sort::{ExternalSorter, ExternalSorterBuilder, LimitedBufferBuilder, Record, RecordFactory};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input_reader = io::BufReader::new(fs::File::open("input.txt").unwrap());
    let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());

    let sorter: ExternalSorter<Record, io::Error> = ExternalSorterBuilder::new(RecordFactory)
        .with_tmp_dir(path::Path::new("./"))
        .with_buffer(LimitedBufferBuilder::new(1_000_000, true))
        .with_memory_segments(4)
        .with_read_ahead(10_000)
        .build()
        .unwrap();

    let sorted = sorter
        .sort(input_reader.lines().map(|line| -> io::Result<Record> {
            let line = line?;
            let number: i64 = line
                .trim()
                .parse()
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

            return Ok(Record::key_only(number));
        }))
        .unwrap();

    for item in sorted.map(Result::unwrap) {
        output_writer.write_all(format!("{}\n", item.key).as_bytes()).unwrap();
    }
    output_writer.flush().unwrap();
}
