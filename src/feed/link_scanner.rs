use std::collections::HashMap;

/// Feed MIME types advertised by autodiscovery links.
const FEED_TYPES: [&str; 2] = ["application/rss+xml", "application/atom+xml"];

/// Attributes of a qualifying `<link rel="alternate">` tag.
///
/// Keys are lowercased; values keep their original case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedLink {
    attributes: HashMap<String, String>,
}

impl FeedLink {
    /// The advertised feed location, exactly as written in the page.
    pub fn href(&self) -> &str {
        // Construction guarantees the key is present
        self.attributes.get("href").map(String::as_str).unwrap_or("")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }
}

/// Scans HTML for a feed autodiscovery link.
///
/// Looks at `<link ...>` tags in document order (case-insensitive) and stops
/// at the first one whose `rel` is `alternate` and whose `type` is an RSS or
/// Atom MIME type. That tag is returned if it carries an `href`; if it does
/// not, the scan gives up rather than trying later tags.
///
/// Uses plain string scanning rather than an HTML parser: the input is a
/// bounded page prefix that may well end mid-tag.
pub fn find_feed_link(html: &str) -> Option<FeedLink> {
    // ASCII lowercasing keeps byte offsets aligned with the original text
    let lower = html.to_ascii_lowercase();
    let mut from = 0;

    while let Some(start) = find_link_open(&lower, from) {
        let body_end = lower[start..]
            .find('>')
            .map(|pos| start + pos)
            .unwrap_or(html.len());
        let tag = &html[start..body_end];
        let attributes = parse_attributes(tag);

        if is_feed_alternate(&attributes) {
            if attributes.contains_key("href") {
                return Some(FeedLink { attributes });
            }
            tracing::debug!(tag = %tag, "Feed link has no href");
            return None;
        }

        from = body_end;
    }

    None
}

/// Finds the next `<link` immediately followed by whitespace.
fn find_link_open(lower: &str, mut from: usize) -> Option<usize> {
    while let Some(pos) = lower[from..].find("<link") {
        let start = from + pos;
        let after = start + "<link".len();
        match lower.as_bytes().get(after) {
            Some(b) if b.is_ascii_whitespace() => return Some(start),
            _ => from = after,
        }
    }
    None
}

fn is_feed_alternate(attributes: &HashMap<String, String>) -> bool {
    let rel = attributes.get("rel").map(|r| r.to_ascii_lowercase());
    let kind = attributes.get("type").map(|t| t.to_ascii_lowercase());

    match (rel, kind) {
        (Some(rel), Some(kind)) => rel == "alternate" && FEED_TYPES.contains(&kind.as_str()),
        _ => false,
    }
}

/// Parses loosely formed attributes from a tag body.
///
/// Keys are runs of ASCII alphanumerics. A key directly followed by `="` or
/// `='` takes the quoted text as its value; anything else between keys is
/// skipped. The element name itself (`link`) is read as a valueless key and
/// ignored.
fn parse_attributes(tag: &str) -> HashMap<String, String> {
    let bytes = tag.as_bytes();
    let mut attributes = HashMap::new();
    let mut i = 0;

    loop {
        while i < bytes.len() && !bytes[i].is_ascii_alphanumeric() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let key_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
            i += 1;
        }
        let key = tag[key_start..i].to_ascii_lowercase();

        if bytes.get(i) == Some(&b'=') {
            if let Some(&quote) = bytes.get(i + 1).filter(|&&q| q == b'"' || q == b'\'') {
                let value_start = i + 2;
                let value_end = tag[value_start..]
                    .find(quote as char)
                    .map(|pos| value_start + pos);
                match value_end {
                    Some(end) => {
                        attributes
                            .entry(key)
                            .or_insert_with(|| tag[value_start..end].to_owned());
                        i = end + 1;
                    }
                    // Unterminated value: the tag was cut off
                    None => break,
                }
            }
        }
    }

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_rss_link() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/feed.xml" title="RSS">
        </head></html>"#;
        let link = find_feed_link(html).unwrap();
        assert_eq!(link.href(), "/feed.xml");
        assert_eq!(link.get("title"), Some("RSS"));
    }

    #[test]
    fn test_finds_atom_link_with_reversed_attributes() {
        let html = r#"<link href="https://example.com/atom" type="application/atom+xml" rel="alternate">"#;
        assert_eq!(
            find_feed_link(&format!("<head>{html}</head>")).unwrap().href(),
            "https://example.com/atom"
        );
    }

    #[test]
    fn test_case_insensitive_tag_and_values() {
        let html = r#"<HEAD><LINK REL="Alternate" TYPE="Application/RSS+XML" HREF="/Feed.XML"></HEAD>"#;
        // Value case is preserved for the href
        assert_eq!(find_feed_link(html).unwrap().href(), "/Feed.XML");
    }

    #[test]
    fn test_single_quoted_values() {
        let html = "<head><link rel='alternate' type='application/rss+xml' href='/rss'></head>";
        assert_eq!(find_feed_link(html).unwrap().href(), "/rss");
    }

    #[test]
    fn test_skips_non_feed_links() {
        let html = r#"<head>
            <link rel="stylesheet" href="/style.css">
            <link rel="icon" type="image/png" href="/favicon.png">
            <link rel="alternate" type="application/rss+xml" href="/feed">
        </head>"#;
        assert_eq!(find_feed_link(html).unwrap().href(), "/feed");
    }

    #[test]
    fn test_no_feed_link() {
        let html = r#"<head><link rel="stylesheet" href="/style.css"></head><body>hi</body>"#;
        assert_eq!(find_feed_link(html), None);
        assert_eq!(find_feed_link(""), None);
    }

    #[test]
    fn test_matching_tag_without_href_stops_scan() {
        let html = r#"<head>
            <link rel="alternate" type="application/rss+xml" title="broken">
            <link rel="alternate" type="application/rss+xml" href="/second">
        </head>"#;
        assert_eq!(find_feed_link(html), None);
    }

    #[test]
    fn test_other_alternate_types_ignored() {
        let html = r#"<link rel="alternate" type="text/html" hreflang="fr" href="/fr">
            <link rel="alternate" type="application/atom+xml" href="/atom">"#;
        assert_eq!(find_feed_link(html).unwrap().href(), "/atom");
    }

    #[test]
    fn test_linkish_tags_not_confused() {
        let html = r#"<linker rel="alternate" type="application/rss+xml" href="/nope">
            <link
                rel="alternate" type="application/rss+xml" href="/yes">"#;
        assert_eq!(find_feed_link(html).unwrap().href(), "/yes");
    }

    #[test]
    fn test_unclosed_final_tag_is_still_read() {
        let html = r#"<head><link rel="alternate" type="application/rss+xml" href="/cut""#;
        assert_eq!(find_feed_link(html).unwrap().href(), "/cut");
    }

    #[test]
    fn test_value_cut_mid_attribute_is_dropped() {
        let html = r#"<link rel="alternate" type="application/rss+xml" href="/trunc"#;
        assert_eq!(find_feed_link(html), None);
    }

    #[test]
    fn test_parse_attributes_loose_syntax() {
        let attrs = parse_attributes(r#"<link rel="alternate" async data-x="1" type = "bad""#);
        assert_eq!(attrs.get("rel").map(String::as_str), Some("alternate"));
        assert_eq!(attrs.get("x").map(String::as_str), Some("1"));
        // Spaces around '=' are not part of the loose syntax
        assert_eq!(attrs.get("type"), None);
    }
}
