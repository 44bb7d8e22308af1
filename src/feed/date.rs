//! Date normalization for item publish dates.
//!
//! Feeds carry dates in whatever format their generator liked. Everything is
//! converted to one canonical UTC form, `YYYY-MM-DD HH:MM:SS`, which sorts
//! lexically and is what storage compares against.

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};

/// Canonical storage format (UTC).
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Long display format, e.g. "Tuesday, June 10, 04:00 AM".
const DISPLAY_FORMAT: &str = "%A, %B %-d, %I:%M %p";

/// Where a pattern's time-zone token sits.
#[derive(Debug, Clone, Copy)]
enum Zone {
    /// No zone in the text; interpreted as UTC.
    None,
    /// Last whitespace-separated token.
    Last,
    /// Token before the trailing year (asctime style).
    BeforeYear,
    /// Numeric offset parsed by chrono's `%z`.
    Numeric,
}

/// Known date shapes, tried in order after colons are removed from the input.
const PATTERNS: &[(&str, Zone)] = &[
    // Tue, 10 Jun 2003 04:00:00 GMT
    ("%a, %d %b %Y %H%M%S", Zone::Last),
    // Tue, 10 Jun 2003 04:00 GMT
    ("%a, %d %b %Y %H%M", Zone::Last),
    // Tue, Jun 10, 2003 04:00 PM
    ("%a, %b %d, %Y %I%M %p", Zone::None),
    // Tue, Jun 10, 2003 04:00:00 PM
    ("%a, %b %d, %Y %I%M%S %p", Zone::None),
    // 10 Jun 2003 04:00:00 GMT
    ("%d %b %Y %H%M%S", Zone::Last),
    // 2003-06-10T04:00:00Z
    ("%Y-%m-%dT%H%M%S%.fZ", Zone::None),
    // 2003-06-10T04:00:00+01:00
    ("%Y-%m-%dT%H%M%S%.f%z", Zone::Numeric),
    // 2003-06-10T04:00:00
    ("%Y-%m-%dT%H%M%S%.f", Zone::None),
    // Tue Jun 10 04:00 GMT 2003
    ("%a %b %d %H%M %Y", Zone::BeforeYear),
    // Tue Jun 10 04:00:00 GMT 2003
    ("%a %b %d %H%M%S %Y", Zone::BeforeYear),
];

/// Result of normalizing a date string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDate {
    /// Canonical `YYYY-MM-DD HH:MM:SS` UTC text.
    pub canonical: String,
    /// True when no pattern matched and the current time was used instead.
    pub fallback: bool,
}

/// Converts arbitrary date text to the canonical UTC form.
///
/// Unparsable text yields the current time; see [`normalize`] when the
/// caller needs to know that happened.
pub fn parse(text: &str) -> String {
    normalize(text).canonical
}

/// Like [`parse`], but reports whether the current-time fallback was used.
pub fn normalize(text: &str) -> NormalizedDate {
    match parse_datetime(text) {
        Some(dt) => NormalizedDate {
            canonical: to_canonical(&dt),
            fallback: false,
        },
        None => {
            tracing::debug!(date = %text, "Unrecognized date format, using current time");
            NormalizedDate {
                canonical: to_canonical(&Utc::now()),
                fallback: true,
            }
        }
    }
}

/// Renders a UTC datetime in canonical form.
pub fn to_canonical(dt: &DateTime<Utc>) -> String {
    dt.format(CANONICAL_FORMAT).to_string()
}

/// Formats a canonical date as a long local date/time for display.
///
/// Text that is not canonical renders as the current time.
pub fn format_display(canonical: &str) -> String {
    let utc = NaiveDateTime::parse_from_str(canonical.trim(), CANONICAL_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or_else(|_| Utc::now());
    utc.with_timezone(&Local).format(DISPLAY_FORMAT).to_string()
}

/// Tries every known pattern in order; first match wins.
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    // Offsets like "+01:00" and times like "04:00:00" both lose their colons,
    // which lets a single set of patterns cover either spelling
    let stripped = text.trim().replace(':', "");
    if stripped.is_empty() {
        return None;
    }

    PATTERNS
        .iter()
        .find_map(|&(format, zone)| try_pattern(&stripped, format, zone))
}

fn try_pattern(text: &str, format: &str, zone: Zone) -> Option<DateTime<Utc>> {
    match zone {
        Zone::None => {
            let naive = NaiveDateTime::parse_from_str(text, format).ok()?;
            Some(Utc.from_utc_datetime(&naive))
        }
        Zone::Numeric => DateTime::parse_from_str(text, format)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Zone::Last => {
            let (rest, token) = text.rsplit_once(char::is_whitespace)?;
            let offset = zone_offset(token)?;
            let naive = NaiveDateTime::parse_from_str(rest.trim_end(), format).ok()?;
            apply_offset(naive, offset)
        }
        Zone::BeforeYear => {
            let mut tokens: Vec<&str> = text.split_whitespace().collect();
            if tokens.len() < 3 {
                return None;
            }
            let token = tokens.remove(tokens.len() - 2);
            let offset = zone_offset(token)?;
            let naive = NaiveDateTime::parse_from_str(&tokens.join(" "), format).ok()?;
            apply_offset(naive, offset)
        }
    }
}

fn apply_offset(naive: NaiveDateTime, offset: FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parses a zone token: an RFC 822 name or a numeric `+HHMM` offset.
fn zone_offset(token: &str) -> Option<FixedOffset> {
    let hours = match token.to_ascii_uppercase().as_str() {
        "GMT" | "UT" | "UTC" | "Z" => Some(0),
        "EDT" => Some(-4),
        "EST" | "CDT" => Some(-5),
        "CST" | "MDT" => Some(-6),
        "MST" | "PDT" => Some(-7),
        "PST" => Some(-8),
        _ => None,
    };
    if let Some(h) = hours {
        return FixedOffset::east_opt(h * 3600);
    }

    // "GMT+0100" style
    let numeric = token
        .strip_prefix("GMT")
        .or_else(|| token.strip_prefix("UTC"))
        .unwrap_or(token);
    let (sign, digits) = match numeric.as_bytes().first()? {
        b'+' => (1, &numeric[1..]),
        b'-' => (-1, &numeric[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hh: i32 = digits[..2].parse().ok()?;
    let mm: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hh * 3600 + mm * 60))
}
