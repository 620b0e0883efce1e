//! # Event Log
//!
//! Durable, ordered per-stream log with consumer groups.
//!
//! Each stream is guarded by its own mutex. An operation plans its
//! transition against the current state, writes it to the stream journal
//! and only then applies it, so a failed journal write leaves the stream
//! untouched and no acknowledged append is lost.
//!
//! Blocked readers wait on a per-stream [`Notify`] bounded by the poll
//! interval. No lock is held across an `.await`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::errors::{EventLogError, EventLogResult};
use super::event::Event;
use super::journal::{discover_streams, Journal};
use super::record::JournalOp;
use super::stream::{MissingGroup, PendingInfo, StartOffset, StreamInfo, StreamRecord, StreamState};
use crate::naming::is_valid_name;

/// Event log configuration
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Journal root; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    /// How long `read_group` waits for an append when nothing is available
    pub poll_interval: Duration,

    /// Retained entries per stream (0 disables trimming)
    pub max_len: usize,

    /// fsync every journal write before returning
    pub sync_on_append: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            poll_interval: Duration::from_millis(1000),
            max_len: 10_000,
            sync_on_append: true,
        }
    }
}

impl EventLogConfig {
    /// In-memory configuration with the given poll interval
    pub fn in_memory(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..Default::default()
        }
    }

    /// Durable configuration rooted at `data_dir`
    pub fn durable(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct StreamCell {
    state: StreamState,
    journal: Option<Journal>,
}

impl StreamCell {
    /// Persist then apply one transition
    fn commit(&mut self, op: JournalOp) -> EventLogResult<()> {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.append(&op) {
                error!(stream = %self.state.name(), error = %e, "journal write failed");
                return Err(e);
            }
        }
        self.state.apply(&op);
        Ok(())
    }
}

#[derive(Debug)]
struct StreamHandle {
    cell: Mutex<StreamCell>,
    appended: Notify,
}

impl StreamHandle {
    fn lock(&self) -> EventLogResult<MutexGuard<'_, StreamCell>> {
        self.cell
            .lock()
            .map_err(|_| EventLogError::Internal("stream lock poisoned".into()))
    }
}

/// The event log
#[derive(Debug)]
pub struct EventLog {
    config: EventLogConfig,
    streams: RwLock<HashMap<String, Arc<StreamHandle>>>,
}

impl EventLog {
    /// Open the log, replaying every journal under the data directory
    pub fn open(config: EventLogConfig) -> EventLogResult<Self> {
        let mut streams = HashMap::new();

        if let Some(data_dir) = &config.data_dir {
            for name in discover_streams(data_dir)? {
                if !is_valid_name(&name) {
                    continue;
                }
                let handle = Self::load_stream(&config, &name)?;
                streams.insert(name, Arc::new(handle));
            }
            info!(
                data_dir = %data_dir.display(),
                streams = streams.len(),
                "event log opened"
            );
        }

        Ok(Self {
            config,
            streams: RwLock::new(streams),
        })
    }

    /// In-memory log
    pub fn in_memory(poll_interval: Duration) -> Self {
        Self {
            config: EventLogConfig::in_memory(poll_interval),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Log configuration
    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    fn load_stream(config: &EventLogConfig, name: &str) -> EventLogResult<StreamHandle> {
        let mut state = StreamState::new(name);
        let journal = match &config.data_dir {
            Some(data_dir) => {
                let (journal, ops) = Journal::open(data_dir, name, config.sync_on_append)?;
                for op in &ops {
                    state.apply(op);
                }
                if !ops.is_empty() {
                    debug!(stream = %name, ops = ops.len(), "journal replayed");
                }
                Some(journal)
            }
            None => None,
        };

        Ok(StreamHandle {
            cell: Mutex::new(StreamCell { state, journal }),
            appended: Notify::new(),
        })
    }

    fn existing(&self, stream: &str) -> EventLogResult<Option<Arc<StreamHandle>>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventLogError::Internal("stream table lock poisoned".into()))?;
        Ok(streams.get(stream).cloned())
    }

    fn get_or_create(&self, stream: &str) -> EventLogResult<Arc<StreamHandle>> {
        if let Some(handle) = self.existing(stream)? {
            return Ok(handle);
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventLogError::Internal("stream table lock poisoned".into()))?;
        if let Some(handle) = streams.get(stream) {
            return Ok(handle.clone());
        }

        let handle = Arc::new(Self::load_stream(&self.config, stream)?);
        streams.insert(stream.to_string(), handle.clone());
        debug!(stream = %stream, "stream created");
        Ok(handle)
    }

    fn missing_group(stream: &str, group: &str) -> EventLogError {
        EventLogError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    fn group_error(stream: &str, group: &str) -> impl Fn(MissingGroup) -> EventLogError {
        let stream = stream.to_string();
        let group = group.to_string();
        move |_| Self::missing_group(&stream, &group)
    }

    fn check_name(kind: &'static str, name: &str) -> EventLogResult<()> {
        if is_valid_name(name) {
            Ok(())
        } else {
            Err(EventLogError::InvalidName {
                kind,
                name: name.to_string(),
            })
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Append an event, returning its stream offset
    ///
    /// The event is validated first; nothing is written for an invalid
    /// event. Duplicate event ids are retained as separate entries.
    pub async fn append(&self, stream: &str, event: Event) -> EventLogResult<u64> {
        Self::check_name("stream", stream)?;
        event.validate()?;

        let handle = self.get_or_create(stream)?;
        let offset = {
            let mut cell = handle.lock()?;
            let op = cell.state.plan_append(event);
            let offset = cell.state.next_offset();
            cell.commit(op)?;

            if let Some(trim) = cell.state.plan_trim(self.config.max_len) {
                // The append is already durable; a failed trim is retried on
                // the next append.
                if let Err(e) = cell.commit(trim) {
                    error!(stream = %stream, error = %e, "retention trim failed");
                }
            }
            offset
        };

        handle.appended.notify_waiters();
        debug!(stream = %stream, offset, "event appended");
        Ok(offset)
    }

    /// Create a consumer group, creating the stream if needed
    ///
    /// Returns `false` if the group already existed.
    pub async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartOffset,
    ) -> EventLogResult<bool> {
        Self::check_name("stream", stream)?;
        Self::check_name("group", group)?;

        let handle = self.get_or_create(stream)?;
        let mut cell = handle.lock()?;
        match cell.state.plan_create_group(group, start) {
            Some(op) => {
                cell.commit(op)?;
                info!(stream = %stream, group = %group, ?start, "consumer group created");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn try_read(
        handle: &StreamHandle,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> EventLogResult<Option<Vec<StreamRecord>>> {
        let mut cell = handle.lock()?;
        let planned = cell
            .state
            .plan_read(group, consumer, max_count, Self::now_ms())
            .map_err(Self::group_error(stream, group))?;

        let Some(op) = planned else {
            return Ok(None);
        };
        let offsets = match &op {
            JournalOp::Deliver { offsets, .. } => offsets.clone(),
            _ => Vec::new(),
        };
        cell.commit(op)?;
        Ok(Some(cell.state.records(&offsets)))
    }

    /// Read for `consumer` within `group`
    ///
    /// Redelivers the consumer's pending entries first. Otherwise delivers
    /// up to `max_count` new entries, waiting up to the poll interval for
    /// an append when none are available.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> EventLogResult<Vec<StreamRecord>> {
        Self::check_name("stream", stream)?;
        Self::check_name("group", group)?;
        Self::check_name("consumer", consumer)?;
        if max_count == 0 {
            return Err(EventLogError::InvalidArgument(
                "max_count must be at least 1".into(),
            ));
        }

        let handle = self
            .existing(stream)?
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let deadline = Instant::now() + self.config.poll_interval;

        loop {
            let notified = handle.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(records) = Self::try_read(&handle, stream, group, consumer, max_count)? {
                debug!(
                    stream = %stream,
                    group = %group,
                    consumer = %consumer,
                    count = records.len(),
                    "entries delivered"
                );
                return Ok(records);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Acknowledge entries; returns how many were actually pending
    pub async fn ack(&self, stream: &str, group: &str, offsets: &[u64]) -> EventLogResult<usize> {
        let handle = self
            .existing(stream)?
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let mut cell = handle.lock()?;
        let planned = cell
            .state
            .plan_ack(group, offsets)
            .map_err(Self::group_error(stream, group))?;

        match planned {
            Some(op) => {
                let count = match &op {
                    JournalOp::Ack { offsets, .. } => offsets.len(),
                    _ => 0,
                };
                cell.commit(op)?;
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// Pending entries of a group
    pub async fn pending(&self, stream: &str, group: &str) -> EventLogResult<Vec<PendingInfo>> {
        let handle = self
            .existing(stream)?
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let cell = handle.lock()?;
        cell.state
            .pending(group, Self::now_ms())
            .map_err(Self::group_error(stream, group))
    }

    /// Transfer pending entries idle for at least `min_idle` to `consumer`
    pub async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> EventLogResult<Vec<StreamRecord>> {
        Self::check_name("consumer", consumer)?;
        let handle = self
            .existing(stream)?
            .ok_or_else(|| Self::missing_group(stream, group))?;
        let mut cell = handle.lock()?;
        let planned = cell
            .state
            .plan_claim(
                group,
                consumer,
                min_idle.as_millis() as i64,
                max_count,
                Self::now_ms(),
            )
            .map_err(Self::group_error(stream, group))?;

        let Some(op) = planned else {
            return Ok(Vec::new());
        };
        let offsets = match &op {
            JournalOp::Claim { offsets, .. } => offsets.clone(),
            _ => Vec::new(),
        };
        cell.commit(op)?;
        info!(stream = %stream, group = %group, consumer = %consumer, count = offsets.len(), "pending entries claimed");
        Ok(cell.state.records(&offsets))
    }

    /// Read entries with offset >= `from` without touching any group
    pub async fn range(&self, stream: &str, from: u64, count: usize) -> EventLogResult<Vec<StreamRecord>> {
        match self.existing(stream)? {
            Some(handle) => Ok(handle.lock()?.state.range(from, count)),
            None => Ok(Vec::new()),
        }
    }

    /// Stream summary, `None` if the stream does not exist
    pub async fn stream_info(&self, stream: &str) -> EventLogResult<Option<StreamInfo>> {
        match self.existing(stream)? {
            Some(handle) => Ok(Some(handle.lock()?.state.info())),
            None => Ok(None),
        }
    }

    /// Names of all known streams, sorted
    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
