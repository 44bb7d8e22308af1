//! Streaming item extraction.
//!
//! [`ingest_items`] pulls XML events from a feed body and hands items to an
//! [`IngestSink`] in batches of [`BATCH_SIZE`]. It is synchronous and meant to
//! run on a blocking worker; the sink decides how batches travel onward.

use std::io::BufRead;
use std::ops::ControlFlow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::{
    date, is_transport_failure, ChannelInfo, ItemRecord, ParseBatch, BATCH_SIZE,
    MAX_ITEMS_PER_FEED,
};
use crate::util::{clean_text, strip_control_chars};

/// Errors that end an ingestion session.
///
/// Batches flushed before the error stay stored.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The feed row disappeared before the session could start.
    #[error("Feed {0} not found")]
    FeedNotFound(i64),

    /// Fetch failed or the body stopped arriving.
    #[error("Network error: {0}")]
    Network(String),

    /// The body is not well-formed XML.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Writing items or feed metadata failed.
    #[error("Database error: {0}")]
    Database(String),

    /// The parser worker panicked or was lost.
    #[error("Worker failed: {0}")]
    Worker(String),

    /// A newer session for the same feed took over.
    #[error("Superseded by a newer refresh")]
    Cancelled,
}

impl From<quick_xml::Error> for IngestError {
    fn from(err: quick_xml::Error) -> Self {
        if is_transport_failure(&err) {
            IngestError::Network(err.to_string())
        } else {
            IngestError::Parse(err.to_string())
        }
    }
}

/// Receives ingestion output as it is produced.
///
/// Returning [`ControlFlow::Break`] stops parsing; [`ingest_items`] then
/// reports [`IngestError::Cancelled`].
pub trait IngestSink {
    /// Channel metadata, delivered at most once and before any batch.
    fn channel(&mut self, info: ChannelInfo) -> ControlFlow<()>;

    /// A full batch, or the final partial one.
    fn batch(&mut self, batch: ParseBatch) -> ControlFlow<()>;
}

/// Outcome of a completed ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    /// Items delivered across all batches.
    pub items: usize,
    /// True when reading stopped at [`MAX_ITEMS_PER_FEED`].
    pub capped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemField {
    Link,
    Title,
    Description,
    Date,
}

impl ItemField {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"link" => Some(Self::Link),
            b"title" => Some(Self::Title),
            b"description" | b"summary" => Some(Self::Description),
            b"pubDate" | b"PubDate" | b"dc:date" | b"published" | b"updated" => Some(Self::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ItemBuilder {
    url: String,
    /// Set when an Atom `<link href>` supplied the url.
    url_from_attr: bool,
    title: String,
    description: String,
    date: Option<String>,
}

impl ItemBuilder {
    fn text_mut(&mut self, field: ItemField) -> &mut String {
        match field {
            ItemField::Link => &mut self.url,
            ItemField::Title => &mut self.title,
            ItemField::Description => &mut self.description,
            ItemField::Date => self.date.get_or_insert_with(String::new),
        }
    }

    fn build(self, feed_id: i64) -> ItemRecord {
        let pub_date = match self.date {
            Some(text) => date::parse(&text),
            None => date::to_canonical(&chrono::Utc::now()),
        };

        ItemRecord {
            feed_id,
            url: strip_control_chars(self.url.trim()).into_owned(),
            title: clean_text(&self.title),
            description: clean_text(&self.description),
            pub_date,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelField {
    Title,
    Description,
}

/// Channel capture state. Only the first channel counts.
#[derive(Debug, Default)]
struct ChannelState {
    /// Element depth of the open channel, if one is open.
    depth: Option<usize>,
    title: String,
    description: String,
    capturing: Option<ChannelField>,
    /// The single update has been handed to the sink.
    sent: bool,
}

impl ChannelState {
    fn take_info(&mut self) -> ChannelInfo {
        fn non_empty(text: &str) -> Option<String> {
            Some(clean_text(text)).filter(|t| !t.is_empty())
        }

        self.sent = true;
        ChannelInfo {
            title: non_empty(&self.title),
            description: non_empty(&self.description),
        }
    }
}

/// One ingestion pass over a feed body.
struct Ingestion<'s, S> {
    feed_id: i64,
    sink: &'s mut S,
    depth: usize,
    channel: ChannelState,
    /// Open item and the element depth it started at.
    item: Option<(usize, ItemBuilder)>,
    item_field: Option<ItemField>,
    batch: ParseBatch,
    count: usize,
}

impl<S: IngestSink> Ingestion<'_, S> {
    fn on_start(&mut self, e: &BytesStart<'_>) -> ControlFlow<()> {
        self.depth += 1;
        let name = e.name();

        match name.as_ref() {
            b"channel" | b"feed" if !self.channel.sent && self.channel.depth.is_none() => {
                self.channel.depth = Some(self.depth);
            }
            b"item" | b"entry" if self.item.is_none() => {
                self.send_channel()?;
                self.item = Some((self.depth, ItemBuilder::default()));
                self.item_field = None;
            }
            other => {
                if let Some((item_depth, builder)) = self.item.as_mut() {
                    if self.depth == *item_depth + 1 {
                        self.item_field = ItemField::from_name(other);
                        if self.item_field == Some(ItemField::Link) {
                            take_link_href(e, builder);
                        }
                        if let Some(field) = self.item_field {
                            if !(field == ItemField::Link && builder.url_from_attr) {
                                builder.text_mut(field).clear();
                            }
                        }
                    }
                } else if self.channel.depth.map(|d| d + 1) == Some(self.depth) {
                    self.channel.capturing = match other {
                        b"title" => Some(ChannelField::Title),
                        b"description" | b"subtitle" => Some(ChannelField::Description),
                        _ => None,
                    };
                    match self.channel.capturing {
                        Some(ChannelField::Title) => self.channel.title.clear(),
                        Some(ChannelField::Description) => self.channel.description.clear(),
                        None => {}
                    }
                }
            }
        }

        ControlFlow::Continue(())
    }

    fn on_empty(&mut self, e: &BytesStart<'_>) {
        // <link href="..."/> is how Atom entries carry their url
        if let Some((item_depth, builder)) = self.item.as_mut() {
            if self.depth == *item_depth && e.name().as_ref() == b"link" {
                take_link_href(e, builder);
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        if let Some((_, builder)) = self.item.as_mut() {
            if let Some(field) = self.item_field {
                if !(field == ItemField::Link && builder.url_from_attr) {
                    builder.text_mut(field).push_str(text);
                }
            }
            return;
        }

        match self.channel.capturing {
            Some(ChannelField::Title) => self.channel.title.push_str(text),
            Some(ChannelField::Description) => self.channel.description.push_str(text),
            None => {}
        }
    }

    /// Returns `Break(())` when reading should stop.
    fn on_end(&mut self) -> Result<ControlFlow<()>, IngestError> {
        let closing = self.depth;
        self.depth = self.depth.saturating_sub(1);

        match self.item.take() {
            Some((item_depth, builder)) if item_depth == closing => {
                self.item_field = None;
                self.batch.push(builder.build(self.feed_id));
                self.count += 1;

                if self.count % BATCH_SIZE == 0 {
                    self.flush()?;
                }
                if self.count >= MAX_ITEMS_PER_FEED {
                    tracing::debug!(feed_id = self.feed_id, "Item cap reached, stopping");
                    return Ok(ControlFlow::Break(()));
                }
            }
            Some(open) => {
                if closing == open.0 + 1 {
                    self.item_field = None;
                }
                self.item = Some(open);
            }
            None => {
                if self.channel.depth == Some(closing) {
                    self.channel.depth = None;
                    self.channel.capturing = None;
                    self.send_channel_result()?;
                } else if self.channel.depth.map(|d| d + 1) == Some(closing) {
                    self.channel.capturing = None;
                }
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    fn send_channel(&mut self) -> ControlFlow<()> {
        if self.channel.sent || self.channel.depth.is_none() {
            return ControlFlow::Continue(());
        }
        let info = self.channel.take_info();
        self.sink.channel(info)
    }

    fn send_channel_result(&mut self) -> Result<(), IngestError> {
        if self.channel.sent {
            return Ok(());
        }
        let info = self.channel.take_info();
        match self.sink.channel(info) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => Err(IngestError::Cancelled),
        }
    }

    fn flush(&mut self) -> Result<(), IngestError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(BATCH_SIZE));
        tracing::trace!(feed_id = self.feed_id, size = batch.len(), "Flushing batch");
        match self.sink.batch(batch) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => Err(IngestError::Cancelled),
        }
    }
}

/// Reads the `href` of an Atom link if it points at the item itself.
fn take_link_href(e: &BytesStart<'_>, builder: &mut ItemBuilder) {
    if builder.url_from_attr {
        return;
    }

    let mut href = None;
    let mut rel_ok = true;
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"href" => {
                href = attr
                    .unescape_value()
                    .map(|v| v.into_owned())
                    .ok()
                    .or_else(|| Some(String::from_utf8_lossy(&attr.value).into_owned()));
            }
            b"rel" => rel_ok = matches!(attr.value.as_ref(), b"alternate"),
            _ => {}
        }
    }

    if let (Some(href), true) = (href, rel_ok) {
        builder.url = href;
        builder.url_from_attr = true;
    }
}

/// Streams items out of a feed body.
///
/// Items reach `sink` in batches of [`BATCH_SIZE`]. Reading stops after
/// [`MAX_ITEMS_PER_FEED`] items or at end of document; either way any
/// partial batch is flushed and the summary returned. Channel metadata goes
/// to the sink once, before the first batch.
///
/// # Errors
///
/// On malformed XML, including a document that ends with elements still
/// open, the item being built and the unflushed batch are discarded and
/// [`IngestError::Parse`] is returned. A failing reader gives
/// [`IngestError::Network`], a sink that breaks gives
/// [`IngestError::Cancelled`].
pub fn ingest_items<R: BufRead, S: IngestSink>(
    reader: R,
    feed_id: i64,
    sink: &mut S,
) -> Result<IngestSummary, IngestError> {
    let mut xml = Reader::from_reader(reader);
    let mut buf = Vec::new();
    let mut state = Ingestion {
        feed_id,
        sink,
        depth: 0,
        channel: ChannelState::default(),
        item: None,
        item_field: None,
        batch: Vec::with_capacity(BATCH_SIZE),
        count: 0,
    };
    let mut capped = false;

    loop {
        let flow = match xml.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => state.on_start(&e),
            Ok(Event::Empty(e)) => {
                state.on_empty(&e);
                ControlFlow::Continue(())
            }
            Ok(Event::Text(e)) => {
                match e.unescape() {
                    Ok(text) => state.on_text(&text),
                    Err(_) => state.on_text(&String::from_utf8_lossy(&e)),
                }
                ControlFlow::Continue(())
            }
            Ok(Event::CData(e)) => {
                state.on_text(&String::from_utf8_lossy(&e));
                ControlFlow::Continue(())
            }
            Ok(Event::End(_)) => match state.on_end()? {
                ControlFlow::Break(()) => {
                    capped = true;
                    break;
                }
                flow => flow,
            },
            // quick-xml reports Eof without checking for open elements
            Ok(Event::Eof) if state.depth > 0 => {
                tracing::debug!(
                    feed_id,
                    items = state.count,
                    open = state.depth,
                    "Feed body ended inside an open element"
                );
                return Err(IngestError::Parse("unexpected end of document".to_string()));
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(
                    feed_id,
                    items = state.count,
                    error = %e,
                    "Feed body failed mid-parse"
                );
                return Err(e.into());
            }
            _ => ControlFlow::Continue(()),
        };

        if flow.is_break() {
            return Err(IngestError::Cancelled);
        }
        buf.clear();
    }

    state.flush()?;

    Ok(IngestSummary {
        items: state.count,
        capped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Collector {
        channels: Vec<ChannelInfo>,
        batches: Vec<ParseBatch>,
        /// Break after this many batches.
        stop_after: Option<usize>,
        /// Index into `batches` at which the channel update arrived.
        channel_at: Option<usize>,
    }

    impl IngestSink for Collector {
        fn channel(&mut self, info: ChannelInfo) -> ControlFlow<()> {
            self.channel_at = Some(self.batches.len());
            self.channels.push(info);
            ControlFlow::Continue(())
        }

        fn batch(&mut self, batch: ParseBatch) -> ControlFlow<()> {
            self.batches.push(batch);
            match self.stop_after {
                Some(n) if self.batches.len() >= n => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        }
    }

    fn rss_with_items(count: usize) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel>\
             <title>Numbers</title><description>Counting</description>",
        );
        for i in 0..count {
            xml.push_str(&format!(
                "<item><title>Item {i}</title><link>https://example.com/{i}</link>\
                 <pubDate>Tue, 10 Jun 2003 04:00:00 GMT</pubDate></item>"
            ));
        }
        xml.push_str("</channel></rss>");
        xml
    }

    fn sizes(collector: &Collector) -> Vec<usize> {
        collector.batches.iter().map(Vec::len).collect()
    }

    #[test]
    fn test_23_items_flush_as_10_10_3() {
        let mut sink = Collector::default();
        let summary = ingest_items(rss_with_items(23).as_bytes(), 7, &mut sink).unwrap();

        assert_eq!(sizes(&sink), vec![10, 10, 3]);
        assert_eq!(summary, IngestSummary { items: 23, capped: false });
        assert!(sink.batches.iter().flatten().all(|item| item.feed_id == 7));
    }

    #[test]
    fn test_exact_batch_multiple_has_no_empty_flush() {
        let mut sink = Collector::default();
        ingest_items(rss_with_items(20).as_bytes(), 1, &mut sink).unwrap();
        assert_eq!(sizes(&sink), vec![10, 10]);
    }

    #[test]
    fn test_cap_stops_at_fifty() {
        let mut sink = Collector::default();
        let summary = ingest_items(rss_with_items(73).as_bytes(), 1, &mut sink).unwrap();

        assert_eq!(summary, IngestSummary { items: 50, capped: true });
        assert_eq!(sizes(&sink), vec![10; 5]);
        let last = sink.batches.last().and_then(|b| b.last()).unwrap();
        assert_eq!(last.title, "Item 49");
    }

    #[test]
    fn test_cap_ignores_malformed_tail() {
        let mut xml = rss_with_items(50);
        xml.truncate(xml.len() - "</channel></rss>".len());
        xml.push_str("<item><title>broken</titl></item>");

        let mut sink = Collector::default();
        let summary = ingest_items(xml.as_bytes(), 1, &mut sink).unwrap();
        assert!(summary.capped);
    }

    #[test]
    fn test_item_fields() {
        let xml = r#"<rss><channel><title>C</title>
            <item>
              <title> <![CDATA[<em>Hello</em> world]]> </title>
              <link> https://example.com/a </link>
              <description>&lt;p&gt;Body&lt;/p&gt;</description>
              <pubDate>Tue, 10 Jun 2003 04:00:00 +0200</pubDate>
            </item>
        </channel></rss>"#;
        let mut sink = Collector::default();
        ingest_items(xml.as_bytes(), 3, &mut sink).unwrap();

        assert_eq!(
            sink.batches,
            vec![vec![ItemRecord {
                feed_id: 3,
                url: "https://example.com/a".to_owned(),
                title: "Hello world".to_owned(),
                description: "Body".to_owned(),
                pub_date: "2003-06-10 02:00:00".to_owned(),
            }]]
        );
    }

    #[test]
    fn test_missing_fields_default() {
        let before = date::to_canonical(&chrono::Utc::now());
        let mut sink = Collector::default();
        ingest_items("<rss><channel><item></item></channel></rss>".as_bytes(), 1, &mut sink)
            .unwrap();
        let after = date::to_canonical(&chrono::Utc::now());

        let item = &sink.batches[0][0];
        assert_eq!(item.url, "");
        assert_eq!(item.title, "");
        assert_eq!(item.description, "");
        assert!(item.pub_date >= before && item.pub_date <= after);
    }

    #[test]
    fn test_date_aliases() {
        let xml = r#"<rss xmlns:dc="http://purl.org/dc/elements/1.1/"><channel>
            <item><dc:date>2003-06-10T04:00:00Z</dc:date></item>
            <item><PubDate>Tue, 10 Jun 2003 05:00:00 GMT</PubDate></item>
        </channel></rss>"#;
        let mut sink = Collector::default();
        ingest_items(xml.as_bytes(), 1, &mut sink).unwrap();

        let dates: Vec<_> = sink.batches[0].iter().map(|i| i.pub_date.as_str()).collect();
        assert_eq!(dates, vec!["2003-06-10 04:00:00", "2003-06-10 05:00:00"]);
    }

    #[test]
    fn test_atom_entries() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Blog</title>
  <subtitle>About things</subtitle>
  <link href="https://example.com/" rel="alternate"/>
  <entry>
    <title>First</title>
    <link rel="self" href="https://example.com/self"/>
    <link href="https://example.com/first"/>
    <summary>Short</summary>
    <published>2003-06-10T04:00:00+01:00</published>
    <updated>2003-06-11T04:00:00Z</updated>
  </entry>
</feed>"#;
        let mut sink = Collector::default();
        ingest_items(xml.as_bytes(), 1, &mut sink).unwrap();

        assert_eq!(
            sink.channels,
            vec![ChannelInfo {
                title: Some("Atom Blog".to_owned()),
                description: Some("About things".to_owned()),
            }]
        );
        let item = &sink.batches[0][0];
        assert_eq!(item.url, "https://example.com/first");
        assert_eq!(item.title, "First");
        assert_eq!(item.description, "Short");
        // The last date element wins
        assert_eq!(item.pub_date, "2003-06-11 04:00:00");
    }

    #[test]
    fn test_channel_sent_once_before_items() {
        let mut sink = Collector::default();
        ingest_items(rss_with_items(3).as_bytes(), 1, &mut sink).unwrap();

        assert_eq!(
            sink.channels,
            vec![ChannelInfo {
                title: Some("Numbers".to_owned()),
                description: Some("Counting".to_owned()),
            }]
        );
        assert_eq!(sink.channel_at, Some(0));
    }

    #[test]
    fn test_channel_without_items_sent_at_channel_end() {
        let xml = "<rss><channel><title>Quiet</title></channel><channel><title>Second</title></channel></rss>";
        let mut sink = Collector::default();
        let summary = ingest_items(xml.as_bytes(), 1, &mut sink).unwrap();

        assert_eq!(summary.items, 0);
        assert!(sink.batches.is_empty());
        assert_eq!(
            sink.channels,
            vec![ChannelInfo {
                title: Some("Quiet".to_owned()),
                description: None,
            }]
        );
    }

    #[test]
    fn test_nested_titles_do_not_leak() {
        let xml = r#"<rss><channel><title>Real</title>
            <image><title>Logo</title></image>
            <item><title>Post</title><source><title>Elsewhere</title></source></item>
        </channel></rss>"#;
        let mut sink = Collector::default();
        ingest_items(xml.as_bytes(), 1, &mut sink).unwrap();

        assert_eq!(sink.channels[0].title.as_deref(), Some("Real"));
        assert_eq!(sink.batches[0][0].title, "Post");
    }

    #[test]
    fn test_parse_error_drops_partial_batch() {
        let mut xml = rss_with_items(14);
        xml.truncate(xml.len() - "</channel></rss>".len());
        xml.push_str("<item><title>bad</wrong></item></channel></rss>");

        let mut sink = Collector::default();
        let result = ingest_items(xml.as_bytes(), 1, &mut sink);

        assert!(matches!(result, Err(IngestError::Parse(_))));
        // The first ten went out; the four after them never did
        assert_eq!(sizes(&sink), vec![10]);
    }

    #[test]
    fn test_truncated_mid_item_is_parse_error() {
        let mut xml = rss_with_items(13);
        xml.truncate(xml.len() - "</channel></rss>".len());
        xml.push_str("<item><title>cut</title>");

        let mut sink = Collector::default();
        let result = ingest_items(xml.as_bytes(), 1, &mut sink);

        assert!(matches!(result, Err(IngestError::Parse(_))));
        assert_eq!(sizes(&sink), vec![10]);
    }

    #[test]
    fn test_unclosed_channel_is_parse_error() {
        let xml = "<rss><channel><title>Open</title><item><title>One</title></item>";
        let mut sink = Collector::default();
        let result = ingest_items(xml.as_bytes(), 1, &mut sink);

        assert!(matches!(result, Err(IngestError::Parse(_))));
        assert!(sink.batches.is_empty());
    }

    #[test]
    fn test_sink_break_cancels() {
        let mut sink = Collector {
            stop_after: Some(1),
            ..Collector::default()
        };
        let result = ingest_items(rss_with_items(30).as_bytes(), 1, &mut sink);

        assert!(matches!(result, Err(IngestError::Cancelled)));
        assert_eq!(sizes(&sink), vec![10]);
    }

    #[test]
    fn test_reader_failure_is_network_error() {
        struct Failing;
        impl std::io::Read for Failing {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "connection reset",
                ))
            }
        }

        let reader = std::io::BufReader::new(Failing);
        let result = ingest_items(reader, 1, &mut Collector::default());
        assert!(matches!(result, Err(IngestError::Network(_))));
    }
}
