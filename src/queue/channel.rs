//! Channel backed queue connecting a producer thread to a consumer.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::queue::{BufferedQueue, ItemReader, ItemWriter, QueueError};

/// Blocking bounded queue built on a channel.
///
/// The queue owns the writing end of the channel until [`ChannelQueue::take_writer`] hands it out to a
/// producer. While the queue still owns the writer, it is used from a single thread and never blocks: reading
/// an empty queue returns [`None`]. Once the writer is handed out, reads block until the producer writes an
/// item or drops the writer, and the producer blocks while the queue is full.
///
/// Closing the queue disconnects the channel. A producer blocked on a full queue is woken up and gets
/// [`QueueError::ProtocolViolation`] from its write.
pub struct ChannelQueue<T> {
    capacity: usize,
    sender: Option<Sender<T>>,
    receiver: Option<Receiver<T>>,
    peeked: Option<T>,
}

/// Writing end of a [`ChannelQueue`].
pub struct ChannelWriter<T> {
    sender: Sender<T>,
}

impl<T> ChannelQueue<T> {
    /// Creates a queue holding at most `capacity` items, 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = if capacity == 0 {
            crossbeam_channel::unbounded()
        } else {
            crossbeam_channel::bounded(capacity)
        };

        ChannelQueue {
            capacity,
            sender: Some(sender),
            receiver: Some(receiver),
            peeked: None,
        }
    }

    /// Hands the writing end out to a producer.
    /// Returns [`None`] if it was already taken.
    pub fn take_writer(&mut self) -> Option<ChannelWriter<T>> {
        self.sender.take().map(|sender| ChannelWriter { sender })
    }

    fn receive(&mut self) -> Option<T> {
        let receiver = self.receiver.as_ref()?;
        if self.sender.is_some() {
            // the writer is local, blocking would never return
            return match receiver.try_recv() {
                Ok(item) => Some(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            };
        }
        receiver.recv().ok()
    }
}

impl<T: Send> ItemWriter<T> for ChannelQueue<T> {
    fn write(&mut self, item: T) -> Result<(), QueueError> {
        if self.is_full() {
            return Err(QueueError::QueueFull {
                capacity: self.capacity,
            });
        }
        match &self.sender {
            Some(sender) => sender
                .send(item)
                .map_err(|_| QueueError::ProtocolViolation("write to a closed channel queue")),
            None => Err(QueueError::ProtocolViolation("channel queue writer was handed out")),
        }
    }

    fn is_full(&self) -> bool {
        self.receiver.as_ref().map_or(false, |receiver| receiver.is_full())
    }
}

impl<T: Send> ItemReader<T> for ChannelQueue<T> {
    fn read(&mut self) -> Result<Option<T>, QueueError> {
        if let Some(item) = self.peeked.take() {
            return Ok(Some(item));
        }
        Ok(self.receive())
    }
}

impl<T: Send> BufferedQueue<T> for ChannelQueue<T> {
    fn peek(&mut self) -> Result<Option<&T>, QueueError> {
        if self.peeked.is_none() {
            self.peeked = self.receive();
        }
        Ok(self.peeked.as_ref())
    }

    /// Returns the number of items buffered at the moment of the call.
    fn len(&self) -> usize {
        let buffered = self.receiver.as_ref().map_or(0, |receiver| receiver.len());
        buffered + self.peeked.is_some() as usize
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) -> Result<(), QueueError> {
        if !self.is_empty() {
            return Err(QueueError::ProtocolViolation("reset of a non empty channel queue"));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), QueueError> {
        self.peeked = None;
        self.sender = None;
        self.receiver = None;
        Ok(())
    }
}

impl<T> ChannelWriter<T> {
    /// Closes the writing end. The reader sees the end of the stream once buffered items are consumed.
    pub fn close(self) {}
}

impl<T> ItemWriter<T> for ChannelWriter<T> {
    fn write(&mut self, item: T) -> Result<(), QueueError> {
        self.sender
            .send(item)
            .map_err(|_| QueueError::ProtocolViolation("write to a closed channel queue"))
    }

    fn is_full(&self) -> bool {
        self.sender.is_full()
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use rstest::*;

    use super::ChannelQueue;
    use crate::queue::{BufferedQueue, ItemReader, ItemWriter, QueueError};

    #[test]
    fn test_local_queue() {
        let mut queue = ChannelQueue::new(2);

        assert_eq!(queue.read().unwrap(), None);
        queue.write(1).unwrap();
        queue.write(2).unwrap();
        assert!(queue.is_full());
        assert!(matches!(queue.write(3), Err(QueueError::QueueFull { capacity: 2 })));

        assert_eq!(queue.peek().unwrap(), Some(&1));
        assert!(matches!(queue.reset(), Err(QueueError::ProtocolViolation(_))));
        assert_eq!(queue.read().unwrap(), Some(1));
        assert_eq!(queue.read().unwrap(), Some(2));
        assert_eq!(queue.read().unwrap(), None);
        queue.reset().unwrap();
    }

    #[rstest]
    #[case(1)]
    #[case(16)]
    #[case(0)]
    fn test_producer_consumer(#[case] capacity: usize) {
        let mut queue = ChannelQueue::new(capacity);
        let mut writer = queue.take_writer().unwrap();
        assert!(queue.take_writer().is_none());

        let producer = thread::spawn(move || {
            for item in 0..1000u64 {
                writer.write(item).unwrap();
            }
            writer.close();
        });

        let mut consumed = Vec::new();
        while let Some(item) = queue.read().unwrap() {
            consumed.push(item);
        }
        producer.join().unwrap();

        assert_eq!(consumed, Vec::from_iter(0..1000u64));
        assert_eq!(queue.peek().unwrap(), None);
    }

    #[test]
    fn test_close_releases_blocked_writer() {
        let mut queue = ChannelQueue::new(1);
        let mut writer = queue.take_writer().unwrap();

        let producer = thread::spawn(move || {
            let mut written = 0;
            while writer.write(written).is_ok() {
                written += 1;
            }
            written
        });

        assert_eq!(queue.read().unwrap(), Some(0));
        queue.close().unwrap();

        let written = producer.join().unwrap();
        assert!(written >= 1);
    }
}
