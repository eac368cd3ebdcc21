use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;
use serde;

use funnel_sort::item::{decode_record, Item, ItemFactory};
use funnel_sort::{ExternalSorter, ExternalSorterBuilder, LimitedBufferBuilder, QueueError};

#[derive(Debug)]
enum CsvParseError {
    RowError(String),
    ColumnError(String),
}

impl Display for CsvParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CsvParseError::ColumnError(err) => write!(f, "column format error: {}", err),
            CsvParseError::RowError(err) => write!(f, "row format error: {}", err),
        }
    }
}

impl Error for CsvParseError {}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Name {
    name: String,
    surname: String,
}

/// Person sorted by age, the name is carried along as the record value.
#[derive(Debug)]
struct Person {
    age: u8,
    name: Name,
}

impl Person {
    fn as_csv(&self) -> String {
        format!("{},{},{}", self.name.name, self.name.surname, self.age)
    }

    fn from_str(s: &str) -> Result<Self, CsvParseError> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            Err(CsvParseError::RowError("wrong columns number".to_string()))
        } else {
            Ok(Person {
                name: Name {
                    name: parts[0].to_string(),
                    surname: parts[1].to_string(),
                },
                age: parts[2]
                    .parse()
                    .map_err(|err| CsvParseError::ColumnError(format!("age field format error: {}", err)))?,
            })
        }
    }
}

impl Item for Person {
    fn key(&self) -> i64 {
        self.age as i64
    }

    fn write_value(&self, buf: &mut Vec<u8>) -> Result<(), QueueError> {
        rmp_serde::encode::write(buf, &self.name).map_err(|err| QueueError::Serialization(Box::new(err)))
    }
}

struct PersonFactory;

impl ItemFactory<Person> for PersonFactory {
    fn new_item(&self, bytes: &[u8]) -> Result<Person, QueueError> {
        let (key, value) = decode_record(bytes)?;
        let name = rmp_serde::from_slice(value).map_err(|err| QueueError::Deserialization(Box::new(err)))?;

        return Ok(Person { age: key as u8, name });
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input_reader = io::BufReader::new(fs::File::open("input.csv").unwrap());
    let mut output_writer = io::BufWriter::new(fs::File::create("output.csv").unwrap());

    let sorter: ExternalSorter<Person, CsvParseError> = ExternalSorterBuilder::new(PersonFactory)
        .with_tmp_dir(path::Path::new("./"))
        .with_buffer(LimitedBufferBuilder::new(1_000_000, true))
        .with_fan_in(64)
        .build()
        .unwrap();

    let sorted = sorter
        .sort_by(
            input_reader
                .lines()
                .map(|line| Person::from_str(&line.map_err(|err| CsvParseError::RowError(err.to_string()))?)),
            |a, b| a.age.cmp(&b.age).reverse(),
        )
        .unwrap();

    for item in sorted.map(Result::unwrap) {
        output_writer
            .write_all(format!("{}\n", item.as_csv()).as_bytes())
            .unwrap();
    }
    output_writer.flush().unwrap();
}
