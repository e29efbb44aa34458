//! The ordered record stream every input is resolved into.

use crate::backpressure::{BufferQueue, QueueConsumer};
use crate::error::Result;
use crate::record::Record;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// An ordered, single-consumer stream of records.
///
/// Items are `Err` only for terminal input failures (a strict decode error,
/// an unreadable file); after one, the stream should be treated as ended.
pub enum RecordStream {
    /// Already materialized.
    Memory(std::vec::IntoIter<Record>),
    /// Fed by an async task or an external producer.
    Channel(mpsc::Receiver<Result<Record>>),
    /// Fed by blocking decoders through a throttled buffer.
    Queue(QueueConsumer),
    /// Records already pulled off `rest`, replayed first.
    Prefixed {
        head: VecDeque<Record>,
        rest: Box<RecordStream>,
    },
}

impl RecordStream {
    /// Wrap a collection. The records are moved, not copied.
    #[must_use]
    pub fn from_records(records: Vec<Record>) -> Self {
        Self::Memory(records.into_iter())
    }

    /// A bounded channel whose sender side feeds the stream.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Record>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::Channel(rx))
    }

    pub async fn next(&mut self) -> Option<Result<Record>> {
        match self {
            Self::Prefixed { head, rest } => match head.pop_front() {
                Some(record) => Some(Ok(record)),
                None => next_unprefixed(rest).await,
            },
            other => next_unprefixed(other).await,
        }
    }

    /// Put `head` back in front of the remaining records.
    #[must_use]
    pub fn with_head(self, head: Vec<Record>) -> Self {
        if head.is_empty() {
            return self;
        }
        match self {
            // Keep a single level of prefixing.
            Self::Prefixed { head: mut old, rest } => {
                for record in head.into_iter().rev() {
                    old.push_front(record);
                }
                Self::Prefixed { head: old, rest }
            }
            other => Self::Prefixed {
                head: head.into(),
                rest: Box::new(other),
            },
        }
    }

    /// The buffer queue behind this stream, if it has one.
    #[must_use]
    pub fn buffer(&self) -> Option<BufferQueue> {
        match self {
            Self::Queue(consumer) => Some(consumer.handle()),
            Self::Prefixed { rest, .. } => rest.buffer(),
            Self::Memory(_) | Self::Channel(_) => None,
        }
    }

    /// Drain the stream into a vector, stopping at the first error.
    ///
    /// # Errors
    /// Returns the first error item.
    pub async fn collect_all(mut self) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

async fn next_unprefixed(stream: &mut RecordStream) -> Option<Result<Record>> {
    match stream {
        RecordStream::Memory(iter) => iter.next().map(Ok),
        RecordStream::Channel(rx) => rx.recv().await,
        RecordStream::Queue(consumer) => consumer.pop().await,
        // `with_head` never nests prefixes.
        RecordStream::Prefixed { .. } => None,
    }
}

impl From<Vec<Record>> for RecordStream {
    fn from(records: Vec<Record>) -> Self {
        Self::from_records(records)
    }
}

impl From<mpsc::Receiver<Result<Record>>> for RecordStream {
    fn from(rx: mpsc::Receiver<Result<Record>>) -> Self {
        Self::Channel(rx)
    }
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory(iter) => write!(f, "RecordStream::Memory({} left)", iter.len()),
            Self::Channel(_) => f.write_str("RecordStream::Channel"),
            Self::Queue(c) => write!(f, "RecordStream::Queue({:?})", c.handle()),
            Self::Prefixed { head, rest } => {
                write!(f, "RecordStream::Prefixed({} + {rest:?})", head.len())
            }
        }
    }
}
