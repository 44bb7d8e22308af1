//! Per-feed ingestion sessions.
//!
//! [`Refresher::refresh`] fetches a stored feed and streams its items into
//! the database. The XML parser runs on a blocking worker and hands channel
//! metadata and item batches to the session task over a small channel; the
//! session task writes them and then announces each batch as a
//! [`FeedEvent::ItemBatch`].
//!
//! Starting a refresh for a feed that already has one running aborts the old
//! session. Aborting drops the parse channel, so the worker stops at its next
//! flush, and drops the body reader, which closes the connection.

use std::collections::HashMap;
use std::ops::ControlFlow;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::ingest::{ingest_items, IngestError, IngestSink, IngestSummary};
use super::transport::Transport;
use super::{ChannelInfo, ParseBatch};
use crate::events::FeedEvent;
use crate::storage::{Database, DatabaseError};
use crate::util::catch_task_panic;

/// Parse results buffered ahead of the database writes.
const PARSE_CHANNEL_DEPTH: usize = 4;

/// Default for [`RefreshSettings::retention`].
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    /// Items not rewritten within this window are deleted when a refresh
    /// starts.
    pub retention: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }
}

impl RefreshSettings {
    pub fn with_retention_days(days: u32) -> Self {
        Self {
            retention: Duration::days(i64::from(days)),
        }
    }
}

enum ParseEvent {
    Channel(ChannelInfo),
    Batch(ParseBatch),
}

/// Forwards parser output from the blocking worker to the session task.
struct ChannelSink {
    tx: mpsc::Sender<ParseEvent>,
}

impl ChannelSink {
    fn forward(&self, event: ParseEvent) -> ControlFlow<()> {
        // The session task is gone once the receiver is dropped
        match self.tx.blocking_send(event) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}

impl IngestSink for ChannelSink {
    fn channel(&mut self, info: ChannelInfo) -> ControlFlow<()> {
        self.forward(ParseEvent::Channel(info))
    }

    fn batch(&mut self, batch: ParseBatch) -> ControlFlow<()> {
        self.forward(ParseEvent::Batch(batch))
    }
}

fn db_error(err: DatabaseError) -> IngestError {
    IngestError::Database(err.to_string())
}

struct ActiveSession {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Owns every running refresh session.
///
/// Generations come from one counter shared by all feeds, so a number is
/// never reused even across different feeds.
pub struct Refresher {
    db: Database,
    transport: Transport,
    events: mpsc::Sender<FeedEvent>,
    settings: RefreshSettings,
    sessions: HashMap<i64, ActiveSession>,
    next_generation: u64,
}

impl Refresher {
    pub fn new(
        db: Database,
        transport: Transport,
        events: mpsc::Sender<FeedEvent>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            db,
            transport,
            events,
            settings,
            sessions: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Starts a refresh of `feed_id`, superseding any running one.
    ///
    /// Returns the generation carried by the new session's events.
    pub fn refresh(&mut self, feed_id: i64) -> u64 {
        if let Some(previous) = self.sessions.remove(&feed_id) {
            previous.handle.abort();
            tracing::debug!(
                feed_id,
                generation = previous.generation,
                "Superseded running refresh"
            );
        }

        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;

        let session = Session {
            db: self.db.clone(),
            transport: self.transport.clone(),
            events: self.events.clone(),
            retention: self.settings.retention,
            feed_id,
            generation,
        };
        let handle = tokio::spawn(session.run());
        self.sessions
            .insert(feed_id, ActiveSession { generation, handle });

        generation
    }

    /// True if `generation` belongs to the latest refresh of `feed_id` and
    /// that refresh has not been finished.
    pub fn is_current(&self, feed_id: i64, generation: u64) -> bool {
        self.sessions
            .get(&feed_id)
            .is_some_and(|s| s.generation == generation)
    }

    /// Forgets a session after its terminal event was handled.
    ///
    /// Returns false for a stale generation, leaving the newer session alone.
    pub fn finish(&mut self, feed_id: i64, generation: u64) -> bool {
        if !self.is_current(feed_id, generation) {
            return false;
        }
        self.sessions.remove(&feed_id);
        true
    }

    /// Number of sessions that have not been finished.
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    pub fn cancel_all(&mut self) {
        for (feed_id, session) in self.sessions.drain() {
            session.handle.abort();
            tracing::debug!(feed_id, generation = session.generation, "Cancelled refresh");
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// State moved into one session task.
struct Session {
    db: Database,
    transport: Transport,
    events: mpsc::Sender<FeedEvent>,
    retention: Duration,
    feed_id: i64,
    generation: u64,
}

impl Session {
    async fn run(self) {
        let feed_id = self.feed_id;
        let generation = self.generation;
        let events = self.events.clone();

        let event = match catch_task_panic(self.ingest()).await {
            Ok(Ok(summary)) => {
                tracing::info!(
                    feed_id,
                    items = summary.items,
                    capped = summary.capped,
                    "Refresh complete"
                );
                FeedEvent::IngestionComplete {
                    feed_id,
                    generation,
                    summary,
                }
            }
            Ok(Err(IngestError::Cancelled)) => {
                tracing::debug!(feed_id, generation, "Refresh cancelled");
                return;
            }
            Ok(Err(error)) => {
                tracing::warn!(feed_id, error = %error, "Refresh failed");
                FeedEvent::IngestionError {
                    feed_id,
                    generation,
                    error,
                }
            }
            Err(panic_msg) => {
                tracing::error!(feed_id, error = %panic_msg, "Refresh task panicked");
                FeedEvent::IngestionError {
                    feed_id,
                    generation,
                    error: IngestError::Worker(panic_msg),
                }
            }
        };
        let _ = events.send(event).await;
    }

    async fn ingest(self) -> Result<IngestSummary, IngestError> {
        let feed_id = self.feed_id;
        let feed = self
            .db
            .get_feed(feed_id)
            .await
            .map_err(db_error)?
            .ok_or(IngestError::FeedNotFound(feed_id))?;

        let removed = self
            .db
            .delete_old_items(feed_id, Utc::now() - self.retention)
            .await
            .map_err(db_error)?;
        if removed > 0 {
            tracing::debug!(feed_id, removed, "Deleted expired items");
        }

        let url = Url::parse(&feed.url)
            .map_err(|e| IngestError::Network(format!("invalid feed URL {}: {}", feed.url, e)))?;
        let response = self
            .transport
            .fetch(&url)
            .await
            .map_err(|e| IngestError::Network(e.to_string()))?;
        let reader = response.into_reader();

        let (tx, mut rx) = mpsc::channel(PARSE_CHANNEL_DEPTH);
        let worker = tokio::task::spawn_blocking(move || {
            let mut sink = ChannelSink { tx };
            ingest_items(reader, feed_id, &mut sink)
        });

        while let Some(parsed) = rx.recv().await {
            match parsed {
                ParseEvent::Channel(info) => {
                    self.db.update_feed(feed_id, &info).await.map_err(db_error)?;
                }
                ParseEvent::Batch(items) => {
                    self.db.add_items(&items).await.map_err(db_error)?;
                    tracing::trace!(feed_id, count = items.len(), "Stored item batch");
                    self.events
                        .send(FeedEvent::ItemBatch {
                            feed_id,
                            generation: self.generation,
                            items,
                        })
                        .await
                        .map_err(|_| IngestError::Cancelled)?;
                }
            }
        }

        worker
            .await
            .map_err(|e| IngestError::Worker(e.to_string()))?
    }
}
