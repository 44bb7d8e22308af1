//! Feed discovery and item ingestion.
//!
//! Turns whatever a user typed into a stored feed, then streams that feed's
//! items into storage:
//!
//! - **Discovery**: fetch the input, sniff the response, follow an HTML
//!   autodiscovery link when needed, read the channel header
//! - **Ingestion**: stream the feed body through a pull parser on a blocking
//!   worker and hand items over in fixed-size batches
//!
//! # Architecture
//!
//! - [`transport`] - HTTP fetch with response metadata and chunked bodies
//! - [`body`] - blocking `BufRead` view of a streaming response body
//! - [`link_scanner`] - `<link rel="alternate">` scan over a bounded page prefix
//! - [`header`] - channel title/description extraction, stops at the first item
//! - [`ingest`] - item extraction with batching and a per-feed cap
//! - [`date`] - publish date normalization
//! - [`discovery`] - the add-feed state machine
//! - [`refresh`] - per-feed ingestion sessions with supersession
//!
//! # Example
//!
//! ```ignore
//! use feedline::feed::{AddFeedSession, Refresher, Transport};
//!
//! let transport = Transport::new("feedline", Duration::from_secs(30))?;
//! let mut session = AddFeedSession::new(transport.clone(), HostPolicy::PublicOnly, tx.clone());
//! session.submit("example.com");
//! ```

pub mod body;
pub mod date;
pub mod discovery;
pub mod header;
pub mod ingest;
pub mod link_scanner;
pub mod refresh;
pub mod transport;

pub use discovery::{AddFeedSession, DiscoveryError, DiscoverySession, DiscoveryState};
pub use ingest::{IngestError, IngestSummary};
pub use refresh::{RefreshSettings, Refresher};
pub use transport::{FetchedResponse, ResponseMeta, Transport, TransportError};

/// Pages shorter than this cannot hold a useful `<head>`.
pub const MIN_PAGE_SIZE: usize = 64;
/// Bytes of an HTML page buffered for link scanning; the rest is never read.
pub const MAX_PAGE_SIZE: usize = 10240;
/// Items read from one feed body before parsing stops.
pub const MAX_ITEMS_PER_FEED: usize = 50;
/// Items per flushed batch.
pub const BATCH_SIZE: usize = 10;
/// Group every newly discovered feed is filed under.
pub const DEFAULT_GROUP_ID: i64 = 1;

/// Feed metadata produced by discovery.
///
/// `title` and `description` are already cleaned and never empty/absent in
/// the sense that the fallbacks (host name, empty string) have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRecord {
    pub url: String,
    pub title: String,
    pub description: String,
    pub group_id: i64,
}

/// One item read from a feed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRecord {
    pub feed_id: i64,
    /// Empty when the item had no link.
    pub url: String,
    pub title: String,
    pub description: String,
    /// Canonical UTC date, see [`date::CANONICAL_FORMAT`].
    pub pub_date: String,
}

/// Items flushed together. Ownership moves to the consumer on flush.
pub type ParseBatch = Vec<ItemRecord>;

/// Channel-level metadata seen while ingesting.
///
/// `None` means the element was missing or blank, so the stored value
/// should be left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Classifies an XML reader failure.
///
/// The body readers only fail with I/O errors when the transport gave up, so
/// those are network problems rather than malformed XML.
pub(crate) fn is_transport_failure(err: &quick_xml::Error) -> bool {
    matches!(err, quick_xml::Error::Io(_))
}
