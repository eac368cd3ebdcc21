//! Item contract and record wire format.
//!
//! Every record that passes through a byte-backed queue is framed as
//!
//! ```text
//! +----------------+----------------+-------------------+
//! | key: i64 (LE)  | len: u32 (LE)  | value: len bytes  |
//! +----------------+----------------+-------------------+
//! ```
//!
//! The fixed header lets a queue find the end of a record (and its key) without decoding the value.

use std::marker::PhantomData;

use serde;

use crate::queue::QueueError;

/// Length of the record header: key followed by value length.
pub const HEADER_LEN: usize = 12;

/// Default upper bound of a serialized record (header included) in bytes.
pub const DEFAULT_MAX_ITEM_LENGTH: usize = 4096;

/// Sortable record interface.
pub trait Item: Send + 'static {
    /// Returns the record key.
    fn key(&self) -> i64;

    /// Appends the record value payload to the buffer.
    fn write_value(&self, buf: &mut Vec<u8>) -> Result<(), QueueError>;
}

/// Item factory. Rebuilds an item from exactly one framed record.
pub trait ItemFactory<T>: Send + Sync {
    /// Creates an item from its serialized representation.
    fn new_item(&self, bytes: &[u8]) -> Result<T, QueueError>;
}

/// Appends the framed representation of the item to the buffer.
pub fn encode_record<I: Item + ?Sized>(item: &I, buf: &mut Vec<u8>) -> Result<(), QueueError> {
    let start = buf.len();
    buf.extend_from_slice(&item.key().to_le_bytes());
    buf.extend_from_slice(&[0; 4]);
    item.write_value(buf)?;

    let value_len = buf.len() - start - HEADER_LEN;
    let value_len = u32::try_from(value_len).map_err(|_| QueueError::ItemTooLarge {
        len: value_len + HEADER_LEN,
        limit: u32::MAX as usize,
    })?;
    buf[start + 8..start + HEADER_LEN].copy_from_slice(&value_len.to_le_bytes());

    return Ok(());
}

/// Returns the full length of the record starting at the beginning of `bytes`.
pub fn record_len(bytes: &[u8]) -> Result<usize, QueueError> {
    if bytes.len() < HEADER_LEN {
        return Err(QueueError::Deserialization("truncated record header".into()));
    }
    let mut len = [0; 4];
    len.copy_from_slice(&bytes[8..HEADER_LEN]);
    let total = HEADER_LEN + u32::from_le_bytes(len) as usize;

    if bytes.len() < total {
        return Err(QueueError::Deserialization("truncated record value".into()));
    }
    return Ok(total);
}

/// Splits a framed record into its key and value.
pub fn decode_record(bytes: &[u8]) -> Result<(i64, &[u8]), QueueError> {
    let total = record_len(bytes)?;
    let mut key = [0; 8];
    key.copy_from_slice(&bytes[..8]);

    return Ok((i64::from_le_bytes(key), &bytes[HEADER_LEN..total]));
}

/// Plain key/value record.
///
/// Ordered by key first and then by value bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Record {
    pub key: i64,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: i64, value: impl Into<Vec<u8>>) -> Self {
        Record {
            key,
            value: value.into(),
        }
    }

    /// Creates a record with an empty value.
    pub fn key_only(key: i64) -> Self {
        Record { key, value: Vec::new() }
    }
}

impl Item for Record {
    fn key(&self) -> i64 {
        self.key
    }

    fn write_value(&self, buf: &mut Vec<u8>) -> Result<(), QueueError> {
        buf.extend_from_slice(&self.value);
        Ok(())
    }
}

/// [`Record`] factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFactory;

impl ItemFactory<Record> for RecordFactory {
    fn new_item(&self, bytes: &[u8]) -> Result<Record, QueueError> {
        let (key, value) = decode_record(bytes)?;
        Ok(Record::new(key, value))
    }
}

/// Record with an arbitrary serde value.
/// The value is stored using MessagePack serialization format.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Keyed<V> {
    pub key: i64,
    pub value: V,
}

impl<V> Keyed<V> {
    pub fn new(key: i64, value: V) -> Self {
        Keyed { key, value }
    }
}

impl<V> Item for Keyed<V>
where
    V: serde::ser::Serialize + Send + 'static,
{
    fn key(&self) -> i64 {
        self.key
    }

    fn write_value(&self, buf: &mut Vec<u8>) -> Result<(), QueueError> {
        rmp_serde::encode::write(buf, &self.value).map_err(|err| QueueError::Serialization(Box::new(err)))
    }
}

/// [`Keyed`] factory decoding MessagePack values.
pub struct RmpFactory<V> {
    value_type: PhantomData<fn() -> V>,
}

impl<V> RmpFactory<V> {
    pub fn new() -> Self {
        RmpFactory { value_type: PhantomData }
    }
}

impl<V> Default for RmpFactory<V> {
    fn default() -> Self {
        RmpFactory::new()
    }
}

impl<V> ItemFactory<Keyed<V>> for RmpFactory<V>
where
    V: serde::de::DeserializeOwned,
{
    fn new_item(&self, bytes: &[u8]) -> Result<Keyed<V>, QueueError> {
        let (key, value) = decode_record(bytes)?;
        let value = rmp_serde::from_slice(value).map_err(|err| QueueError::Deserialization(Box::new(err)))?;

        return Ok(Keyed { key, value });
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{decode_record, encode_record, record_len, ItemFactory, Keyed, Record, RecordFactory, RmpFactory};
    use super::HEADER_LEN;
    use crate::queue::QueueError;

    #[test]
    fn test_record_layout() {
        let mut buf = Vec::new();
        encode_record(&Record::new(-2, "abc"), &mut buf).unwrap();

        let mut expected = Vec::from((-2i64).to_le_bytes());
        expected.extend_from_slice(&3u32.to_le_bytes());
        expected.extend_from_slice(b"abc");
        assert_eq!(buf, expected);

        assert_eq!(record_len(&buf).unwrap(), HEADER_LEN + 3);
        assert_eq!(decode_record(&buf).unwrap(), (-2, &b"abc"[..]));
    }

    #[rstest]
    #[case(vec![])]
    #[case(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11])]
    #[case(vec![0, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 1])]
    fn test_truncated_record(#[case] bytes: Vec<u8>) {
        assert!(matches!(record_len(&bytes), Err(QueueError::Deserialization(_))));
    }

    #[test]
    fn test_record_factory_ignores_trailing_bytes() {
        let mut buf = Vec::new();
        encode_record(&Record::new(7, vec![1, 2]), &mut buf).unwrap();
        encode_record(&Record::key_only(8), &mut buf).unwrap();

        let first = RecordFactory.new_item(&buf).unwrap();
        assert_eq!(first, Record::new(7, vec![1, 2]));
    }

    #[test]
    fn test_rmp_factory() {
        let item = Keyed::new(42, (String::from("hello"), 3u8));
        let mut buf = Vec::new();
        encode_record(&item, &mut buf).unwrap();

        let factory: RmpFactory<(String, u8)> = RmpFactory::new();
        assert_eq!(factory.new_item(&buf).unwrap(), item);
    }
}
