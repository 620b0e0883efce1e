//! # Event Log
//!
//! Durable per-stream logs of domain events with consumer groups.
//!
//! - Producers append validated [`Event`]s and get back a stream offset
//! - Consumer groups track a delivery cursor and pending entries per member
//! - Journals under `<data_dir>/streams/` make every transition durable
//! - [`StreamConsumer`] drains a group with retries and a dead-letter stream

mod consumer;
mod errors;
mod event;
mod journal;
mod log;
mod record;
mod stream;

pub use consumer::{
    dead_letter_stream, ConsumerConfig, EventHandler, IdempotencyWindow, PollReport,
    StreamConsumer, DLQ_SUFFIX,
};
pub use errors::{EventLogError, EventLogResult, HandlerError};
pub use event::{Event, MAX_EVENT_BYTES, RETRY_COUNT_KEY};
pub use journal::{discover_streams, journal_dir, JOURNAL_EXTENSION};
pub use log::{EventLog, EventLogConfig};
pub use record::{compute_checksum, JournalOp};
pub use stream::{PendingInfo, StartOffset, StreamInfo, StreamRecord};
