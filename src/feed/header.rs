use std::io::BufRead;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use super::{is_transport_failure, FeedRecord, DEFAULT_GROUP_ID};
use crate::util::clean_text;

/// Errors from reading a feed header.
///
/// Stopping early because the header is complete is not an error.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The body stopped arriving mid-document.
    #[error("Connection interrupted: {0}")]
    Interrupted(String),

    /// The document is not well-formed XML.
    #[error("XML parse error: {0}")]
    Xml(String),
}

impl From<quick_xml::Error> for HeaderError {
    fn from(err: quick_xml::Error) -> Self {
        if is_transport_failure(&err) {
            HeaderError::Interrupted(err.to_string())
        } else {
            HeaderError::Xml(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Description,
}

/// Mutable state of one header parse.
///
/// Owned by [`parse_header`]; [`HeaderContext::finalize`] consumes it, so a
/// record is produced exactly once whichever way reading ended.
struct HeaderContext<'a> {
    feed_url: &'a str,
    host: &'a str,
    title: String,
    description: String,
    capturing: Option<Field>,
    have_title: bool,
    have_description: bool,
}

impl<'a> HeaderContext<'a> {
    fn new(feed_url: &'a str, host: &'a str) -> Self {
        Self {
            feed_url,
            host,
            title: String::new(),
            description: String::new(),
            capturing: None,
            have_title: false,
            have_description: false,
        }
    }

    fn begin(&mut self, field: Field) {
        match field {
            Field::Title => self.title.clear(),
            Field::Description => self.description.clear(),
        }
        self.capturing = Some(field);
    }

    fn push_text(&mut self, text: &str) {
        match self.capturing {
            Some(Field::Title) => self.title.push_str(text),
            Some(Field::Description) => self.description.push_str(text),
            None => {}
        }
    }

    /// Closes a field. Returns true once both fields have been seen.
    fn end(&mut self, field: Field) -> bool {
        match field {
            Field::Title => self.have_title = true,
            Field::Description => self.have_description = true,
        }
        self.capturing = None;
        self.have_title && self.have_description
    }

    fn finalize(self) -> FeedRecord {
        let title = clean_text(&self.title);
        let title = if title.is_empty() {
            clean_text(self.host)
        } else {
            title
        };

        FeedRecord {
            url: self.feed_url.to_owned(),
            title,
            description: clean_text(&self.description),
            group_id: DEFAULT_GROUP_ID,
        }
    }
}

fn field_for(name: &[u8]) -> Option<Field> {
    match name {
        b"title" => Some(Field::Title),
        b"description" | b"subtitle" => Some(Field::Description),
        _ => None,
    }
}

/// Reads a feed's channel title and description.
///
/// Pulls events until both fields have been closed or the first
/// `item`/`entry` starts, then stops without reading the rest of the body.
/// Missing titles fall back to `host`, missing descriptions to the empty
/// string.
///
/// Running out of document is accepted even with elements still open:
/// `<rss><channel><title>T</title>` then EOF yields a record titled `T`.
/// Item ingestion is stricter and reports the same truncation as a parse
/// error.
///
/// # Errors
///
/// [`HeaderError::Xml`] if malformed XML is hit before reading stopped,
/// [`HeaderError::Interrupted`] if the body reader failed.
pub fn parse_header<R: BufRead>(
    reader: R,
    feed_url: &str,
    host: &str,
) -> Result<FeedRecord, HeaderError> {
    let mut xml = Reader::from_reader(reader);
    let mut ctx = HeaderContext::new(feed_url, host);
    let mut buf = Vec::new();

    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name();
                if matches!(name.as_ref(), b"item" | b"entry") {
                    tracing::trace!("Reached first item, header complete");
                    break;
                }
                if let Some(field) = field_for(name.as_ref()) {
                    ctx.begin(field);
                }
            }
            Ok(Event::Empty(e)) if matches!(e.name().as_ref(), b"item" | b"entry") => break,
            Ok(Event::Text(e)) => match e.unescape() {
                Ok(text) => ctx.push_text(&text),
                // Undeclared HTML entities; flattening decodes the common ones
                Err(_) => ctx.push_text(&String::from_utf8_lossy(&e)),
            },
            Ok(Event::CData(e)) => ctx.push_text(&String::from_utf8_lossy(&e)),
            Ok(Event::End(e)) => {
                if let Some(field) = field_for(e.name().as_ref()) {
                    if ctx.end(field) {
                        break;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(url = %feed_url, error = %e, "Feed header is not valid XML");
                return Err(e.into());
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(ctx.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const URL: &str = "https://example.com/feed.xml";
    const HOST: &str = "example.com";

    fn parse(xml: &str) -> Result<FeedRecord, HeaderError> {
        parse_header(xml.as_bytes(), URL, HOST)
    }

    #[test]
    fn test_rss_header() {
        let record = parse(
            r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example Blog</title>
  <link>https://example.com</link>
  <description>An example blog about things</description>
  <item><title>First Post</title></item>
</channel></rss>"#,
        )
        .unwrap();

        assert_eq!(
            record,
            FeedRecord {
                url: URL.to_owned(),
                title: "Example Blog".to_owned(),
                description: "An example blog about things".to_owned(),
                group_id: DEFAULT_GROUP_ID,
            }
        );
    }

    #[test]
    fn test_title_only_gets_empty_description() {
        let record = parse("<rss><channel><title>T</title><item/></channel></rss>").unwrap();
        assert_eq!(record.title, "T");
        assert_eq!(record.description, "");
    }

    #[test]
    fn test_missing_title_falls_back_to_host() {
        let record = parse("<rss><channel><description>d</description></channel></rss>").unwrap();
        assert_eq!(record.title, HOST);
        assert_eq!(record.description, "d");
    }

    #[test]
    fn test_blank_title_falls_back_to_host() {
        let record = parse("<rss><channel><title>  <![CDATA[ ]]> </title></channel></rss>").unwrap();
        assert_eq!(record.title, HOST);
    }

    #[test]
    fn test_stops_at_first_item() {
        // The malformed tail is never reached
        let record = parse(
            "<rss><channel><title>Head</title><item><title>Item</title></item><broken</channel>",
        )
        .unwrap();
        assert_eq!(record.title, "Head");
        assert_eq!(record.description, "");
    }

    #[test]
    fn test_stops_once_both_fields_seen() {
        let record = parse(
            "<rss><channel><title>A</title><description>B</description><oops></channel>",
        )
        .unwrap();
        assert_eq!(record.title, "A");
        assert_eq!(record.description, "B");
    }

    #[test]
    fn test_atom_subtitle_and_entry() {
        let record = parse(
            r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <title type="text">Atom Blog</title>
  <subtitle>Things &amp; stuff</subtitle>
  <entry><title>Post</title></entry>
</feed>"#,
        )
        .unwrap();
        assert_eq!(record.title, "Atom Blog");
        assert_eq!(record.description, "Things & stuff");
    }

    #[test]
    fn test_markup_and_cdata_are_flattened() {
        let record = parse(
            "<rss><channel><title><![CDATA[<b>Bold</b> news]]></title>\
             <description>  line one\n  line &lt;i&gt;two&lt;/i&gt;  </description></channel></rss>",
        )
        .unwrap();
        assert_eq!(record.title, "Bold news");
        assert_eq!(record.description, "line one line two");
    }

    #[test]
    fn test_text_split_across_events_is_joined() {
        let record = parse("<rss><channel><title>Fish &amp; <![CDATA[Chips]]></title></channel></rss>")
            .unwrap();
        assert_eq!(record.title, "Fish & Chips");
    }

    #[test]
    fn test_restarted_element_resets_value() {
        let record = parse(
            "<rss><channel><title>First</title><image><title>Logo</title></image></channel></rss>",
        )
        .unwrap();
        assert_eq!(record.title, "Logo");
    }

    #[test]
    fn test_undeclared_entity_kept_and_flattened() {
        let record = parse("<rss><channel><title>a&nbsp;b</title></channel></rss>").unwrap();
        assert_eq!(record.title, "a b");
    }

    #[test]
    fn test_control_chars_stripped() {
        let record = parse("<rss><channel><title>Evil\x1b[31m Feed</title></channel></rss>").unwrap();
        assert_eq!(record.title, "Evil Feed");
    }

    #[test]
    fn test_malformed_before_finish_is_error() {
        let result = parse("<rss><channel><title>T</titel></channel></rss>");
        assert!(matches!(result, Err(HeaderError::Xml(_))));
    }

    #[test]
    fn test_truncated_header_still_resolves() {
        let record = parse("<rss><channel><title>T</title>").unwrap();
        assert_eq!(record.title, "T");
        assert_eq!(record.description, "");
    }

    #[test]
    fn test_empty_document_uses_fallbacks() {
        let record = parse("").unwrap();
        assert_eq!(record.title, HOST);
        assert_eq!(record.url, URL);
    }
}
