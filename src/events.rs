//! Messages from background sessions to the task that owns the event loop.
//!
//! Every discovery and refresh session reports through one
//! `mpsc::Sender<FeedEvent>`. The receiving loop is the only place that
//! applies user-visible changes, so nothing here is shared across tasks.
//!
//! Each event carries the generation of the session that produced it. A
//! session that has been superseded keeps the old generation, which lets the
//! consumer drop anything it sends late.

use crate::feed::{FeedRecord, IngestError, IngestSummary, ParseBatch};

/// Channel capacity used by the application loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events from background tasks
#[derive(Debug)]
pub enum FeedEvent {
    /// Progress text from an add-feed session ("Requesting ...").
    DiscoveryStatus { generation: u64, message: String },
    /// Discovery finished with a feed.
    FeedResolved { generation: u64, feed: FeedRecord },
    /// Discovery finished without a feed. `message` is user-facing.
    DiscoveryFailed { generation: u64, message: String },
    /// Discovery could not reach the network.
    NetworkError { generation: u64, error: String },
    /// A batch of items was stored for `feed_id`.
    ItemBatch {
        feed_id: i64,
        generation: u64,
        items: ParseBatch,
    },
    /// A refresh stopped early. Earlier batches remain stored.
    IngestionError {
        feed_id: i64,
        generation: u64,
        error: IngestError,
    },
    /// A refresh read the whole feed, or stopped at the item cap.
    IngestionComplete {
        feed_id: i64,
        generation: u64,
        summary: IngestSummary,
    },
}

impl FeedEvent {
    pub fn generation(&self) -> u64 {
        match self {
            FeedEvent::DiscoveryStatus { generation, .. }
            | FeedEvent::FeedResolved { generation, .. }
            | FeedEvent::DiscoveryFailed { generation, .. }
            | FeedEvent::NetworkError { generation, .. }
            | FeedEvent::ItemBatch { generation, .. }
            | FeedEvent::IngestionError { generation, .. }
            | FeedEvent::IngestionComplete { generation, .. } => *generation,
        }
    }

    /// The feed a refresh event belongs to; `None` for discovery events.
    pub fn feed_id(&self) -> Option<i64> {
        match self {
            FeedEvent::ItemBatch { feed_id, .. }
            | FeedEvent::IngestionError { feed_id, .. }
            | FeedEvent::IngestionComplete { feed_id, .. } => Some(*feed_id),
            _ => None,
        }
    }

    /// True for events that end a session.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            FeedEvent::DiscoveryStatus { .. } | FeedEvent::ItemBatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let status = FeedEvent::DiscoveryStatus {
            generation: 4,
            message: "Requesting http://example.com/".into(),
        };
        assert_eq!(status.generation(), 4);
        assert_eq!(status.feed_id(), None);
        assert!(!status.is_terminal());

        let done = FeedEvent::IngestionComplete {
            feed_id: 9,
            generation: 2,
            summary: IngestSummary {
                items: 3,
                capped: false,
            },
        };
        assert_eq!(done.generation(), 2);
        assert_eq!(done.feed_id(), Some(9));
        assert!(done.is_terminal());
    }
}
