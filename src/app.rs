//! Application state and the event loop's handlers.
//!
//! [`App`] owns the receiving end of the feed event channel. Discovery and
//! refresh sessions run as background tasks and only report; every database
//! write that follows from a discovery, and every user-visible update,
//! happens here.

use std::ops::ControlFlow;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::events::{FeedEvent, EVENT_CHANNEL_CAPACITY};
use crate::feed::date::format_display;
use crate::feed::{
    AddFeedSession, FeedRecord, IngestError, IngestSummary, RefreshSettings, Refresher, Transport,
};
use crate::storage::{AddFeedOutcome, Database, DatabaseError, StoredFeed, StoredItem};
use crate::util::{strip_control_chars, truncate_to_width, HostPolicy};

// ============================================================================
// Updates
// ============================================================================

/// What the event loop surfaced after handling one event.
#[derive(Debug)]
pub enum Update {
    /// Discovery progress text.
    Status(String),
    /// A discovered feed was stored.
    FeedAdded {
        outcome: AddFeedOutcome,
        feed: FeedRecord,
    },
    /// Discovery ended without a feed.
    AddFailed(String),
    /// A refresh stored a batch.
    ItemsStored { feed_id: i64, count: usize },
    RefreshComplete {
        feed_id: i64,
        summary: IngestSummary,
    },
    RefreshFailed { feed_id: i64, error: IngestError },
}

impl Update {
    /// True once the add-feed session that produced this is over.
    pub fn ends_add(&self) -> bool {
        matches!(self, Update::FeedAdded { .. } | Update::AddFailed(_))
    }
}

// ============================================================================
// Application State
// ============================================================================

/// Central application state
pub struct App {
    pub db: Database,
    discovery: AddFeedSession,
    refresher: Refresher,
    event_rx: mpsc::Receiver<FeedEvent>,
}

impl App {
    pub fn new(
        db: Database,
        transport: Transport,
        policy: HostPolicy,
        settings: RefreshSettings,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            discovery: AddFeedSession::new(transport.clone(), policy, event_tx.clone()),
            refresher: Refresher::new(db.clone(), transport, event_tx, settings),
            db,
            event_rx,
        }
    }

    /// Starts discovery for user input. Blank input is ignored.
    pub fn add_feed(&mut self, input: &str) -> Option<u64> {
        self.discovery.submit(input)
    }

    /// Starts (or restarts) a refresh of one feed.
    pub fn refresh(&mut self, feed_id: i64) -> u64 {
        self.refresher.refresh(feed_id)
    }

    /// Starts a refresh of every stored feed, returning the ids.
    pub async fn refresh_all(&mut self) -> Result<Vec<i64>, DatabaseError> {
        let ids = self.db.list_feed_ids().await?;
        for &feed_id in &ids {
            self.refresher.refresh(feed_id);
        }
        tracing::info!(feeds = ids.len(), "Refreshing all feeds");
        Ok(ids)
    }

    /// Refreshes whose terminal event has not been handled yet.
    pub fn pending_refreshes(&self) -> usize {
        self.refresher.active()
    }

    /// Waits for the next event that is still relevant.
    ///
    /// Returns `None` only if every sender is gone, which cannot happen while
    /// `self` holds the sessions.
    pub async fn next_update(&mut self) -> Option<Update> {
        loop {
            let event = self.event_rx.recv().await?;
            if let Some(update) = self.handle_event(event).await {
                return Some(update);
            }
        }
    }

    /// Drives the loop until `on_update` breaks.
    pub async fn run_until<F>(&mut self, mut on_update: F)
    where
        F: FnMut(&Update) -> ControlFlow<()>,
    {
        while let Some(update) = self.next_update().await {
            if on_update(&update).is_break() {
                break;
            }
        }
    }

    /// Handles events until every started refresh has reported.
    pub async fn drain_refreshes<F>(&mut self, mut on_update: F)
    where
        F: FnMut(&Update),
    {
        while self.pending_refreshes() > 0 {
            match self.next_update().await {
                Some(update) => on_update(&update),
                None => break,
            }
        }
    }

    /// Applies one event. Stale events yield `None`.
    pub async fn handle_event(&mut self, event: FeedEvent) -> Option<Update> {
        match event {
            FeedEvent::DiscoveryStatus {
                generation,
                message,
            } => self
                .current_discovery(generation)
                .then_some(Update::Status(message)),
            FeedEvent::FeedResolved { generation, feed } => {
                if !self.current_discovery(generation) {
                    return None;
                }
                match self.db.add_feed(&feed).await {
                    Ok(outcome) => {
                        tracing::info!(url = %feed.url, ?outcome, "Feed added");
                        Some(Update::FeedAdded { outcome, feed })
                    }
                    Err(e) => {
                        tracing::error!(url = %feed.url, error = %e, "Failed to store feed");
                        Some(Update::AddFailed(format!("Failed to store feed: {}", e)))
                    }
                }
            }
            FeedEvent::DiscoveryFailed {
                generation,
                message,
            } => self
                .current_discovery(generation)
                .then_some(Update::AddFailed(message)),
            FeedEvent::NetworkError { generation, error } => self
                .current_discovery(generation)
                .then_some(Update::AddFailed(error)),
            FeedEvent::ItemBatch {
                feed_id,
                generation,
                items,
            } => {
                if !self.current_refresh(feed_id, generation) {
                    return None;
                }
                Some(Update::ItemsStored {
                    feed_id,
                    count: items.len(),
                })
            }
            FeedEvent::IngestionError {
                feed_id,
                generation,
                error,
            } => self
                .finish_refresh(feed_id, generation)
                .then_some(Update::RefreshFailed { feed_id, error }),
            FeedEvent::IngestionComplete {
                feed_id,
                generation,
                summary,
            } => self
                .finish_refresh(feed_id, generation)
                .then_some(Update::RefreshComplete { feed_id, summary }),
        }
    }

    // Stale results arrive when a session was superseded after it had
    // already queued an event; the generation check drops them.
    fn current_discovery(&self, generation: u64) -> bool {
        let current = self.discovery.is_current(generation);
        if !current {
            tracing::debug!(
                expected = self.discovery.generation(),
                got = generation,
                "Ignoring stale discovery event (generation mismatch)"
            );
        }
        current
    }

    fn current_refresh(&self, feed_id: i64, generation: u64) -> bool {
        let current = self.refresher.is_current(feed_id, generation);
        if !current {
            tracing::debug!(feed_id, generation, "Ignoring stale refresh event");
        }
        current
    }

    fn finish_refresh(&mut self, feed_id: i64, generation: u64) -> bool {
        let finished = self.refresher.finish(feed_id, generation);
        if !finished {
            tracing::debug!(feed_id, generation, "Ignoring stale refresh result");
        }
        finished
    }

    // ========================================================================
    // Listings
    // ========================================================================

    pub async fn feeds(&self) -> Result<Vec<StoredFeed>, DatabaseError> {
        let mut feeds = Vec::new();
        for id in self.db.list_feed_ids().await? {
            if let Some(feed) = self.db.get_feed(id).await? {
                feeds.push(feed);
            }
        }
        Ok(feeds)
    }

    pub async fn items(&self, feed_id: i64) -> Result<Vec<StoredItem>, DatabaseError> {
        let mut items = Vec::new();
        for id in self.db.list_item_ids(feed_id).await? {
            if let Some(item) = self.db.get_item(id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }
}

// ============================================================================
// Formatting
// ============================================================================

/// Feed listing row as printed by `feeds --json`.
#[derive(Debug, Serialize)]
pub struct FeedListing<'a> {
    #[serde(flatten)]
    pub feed: &'a StoredFeed,
    pub items: i64,
}

/// One line per feed: id, title, item count.
pub fn format_feed_line(feed: &StoredFeed, items: i64, width: usize) -> String {
    let prefix = format!("{:>5}  ", feed.id);
    let suffix = format!("  ({} items)", items);
    let room = width.saturating_sub(prefix.len() + suffix.len());
    let title = strip_control_chars(&feed.title);
    format!("{}{}{}", prefix, truncate_to_width(&title, room), suffix)
}

/// Two lines per item: date and title, then the link.
pub fn format_item_lines(item: &StoredItem, width: usize) -> String {
    let date = format_display(&item.pub_date);
    let room = width.saturating_sub(date.len() + 2);
    let title = strip_control_chars(&item.title);
    let url = strip_control_chars(&item.url);
    format!(
        "{}  {}\n    {}",
        date,
        truncate_to_width(&title, room),
        truncate_to_width(&url, width.saturating_sub(4))
    )
}
