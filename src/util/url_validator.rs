use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// Covers malformed input as well as the SSRF policy applied to every URL
/// the discovery session is about to fetch.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Which hosts a fetch is allowed to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostPolicy {
    /// Reject localhost, loopback and private address ranges.
    #[default]
    PublicOnly,
    /// Accept any host. Used for local testing and intranet feeds.
    AllowPrivate,
}

impl HostPolicy {
    pub fn from_allow_private(allow: bool) -> Self {
        if allow {
            Self::AllowPrivate
        } else {
            Self::PublicOnly
        }
    }
}

/// Normalizes user input into a fetchable URL string.
///
/// Trims whitespace and prepends `http://` when the input has no
/// `http://`/`https://` prefix. Returns `None` for empty input so callers
/// can treat it as a no-op.
///
/// ```
/// use feedline::util::normalize_input;
///
/// assert_eq!(normalize_input(" example.com ").as_deref(), Some("http://example.com"));
/// assert_eq!(normalize_input("https://example.com/feed").as_deref(), Some("https://example.com/feed"));
/// assert_eq!(normalize_input("   "), None);
/// ```
pub fn normalize_input(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Some(trimmed.to_owned())
    } else {
        Some(format!("http://{trimmed}"))
    }
}

/// Validates a URL string before it is fetched.
///
/// Always requires an http(s) scheme and a host. Under
/// [`HostPolicy::PublicOnly`] it also rejects, to prevent SSRF:
/// - `localhost`, `127.0.0.1`, `::1`
/// - Private IP ranges (RFC 1918, link-local, unique local IPv6)
///
/// # Errors
///
/// Returns [`UrlValidationError`] describing the first failed check.
///
/// ```
/// use feedline::util::{validate_url, HostPolicy};
///
/// let url = validate_url("https://example.com/feed.xml", HostPolicy::PublicOnly).unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_url("http://localhost/feed", HostPolicy::PublicOnly).is_err());
/// assert!(validate_url("http://localhost/feed", HostPolicy::AllowPrivate).is_ok());
/// assert!(validate_url("file:///etc/passwd", HostPolicy::AllowPrivate).is_err());
/// ```
pub fn validate_url(url_str: &str, policy: HostPolicy) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if policy == HostPolicy::AllowPrivate {
        return Ok(url);
    }

    if host == "localhost" {
        return Err(UrlValidationError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

/// Resolves a possibly relative link against the page it was found on.
///
/// Absolute URLs pass through unchanged. Protocol-relative links inherit the
/// page's scheme. Anything the URL parser cannot join is returned as-is and
/// left for [`validate_url`] to reject.
pub fn resolve_href(href: &str, base: &Url) -> String {
    // Join through the URL parser so credentials and dot segments are normalized
    match base.join(href) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => href.to_owned(),
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC: HostPolicy = HostPolicy::PublicOnly;

    #[test]
    fn test_normalize_prepends_scheme() {
        assert_eq!(
            normalize_input("example.com").as_deref(),
            Some("http://example.com")
        );
        assert_eq!(
            normalize_input("\texample.com/blog\n").as_deref(),
            Some("http://example.com/blog")
        );
    }

    #[test]
    fn test_normalize_keeps_existing_scheme() {
        assert_eq!(
            normalize_input("https://example.com").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            normalize_input("http://example.com").as_deref(),
            Some("http://example.com")
        );
    }

    #[test]
    fn test_normalize_empty_is_none() {
        assert_eq!(normalize_input(""), None);
        assert_eq!(normalize_input("  \n "), None);
    }

    #[test]
    fn test_valid_urls() {
        assert!(validate_url("https://example.com/feed.xml", PUBLIC).is_ok());
        assert!(validate_url("http://news.example.org", PUBLIC).is_ok());
        assert!(validate_url("https://example.com:443/feed.xml", PUBLIC).is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_url("ftp://example.com", PUBLIC),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_url("file:///etc/passwd", HostPolicy::AllowPrivate).is_err());
    }

    #[test]
    fn test_unparsable_url() {
        assert!(matches!(
            validate_url("http://exa mple.com", PUBLIC),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_localhost_rejected() {
        assert!(validate_url("http://localhost/feed", PUBLIC).is_err());
        assert!(validate_url("http://127.0.0.1/feed", PUBLIC).is_err());
        assert!(validate_url("http://[::1]/feed", PUBLIC).is_err());
    }

    #[test]
    fn test_private_ips_rejected() {
        assert!(validate_url("http://192.168.1.1/feed", PUBLIC).is_err());
        assert!(validate_url("http://10.0.0.1:3000/feed", PUBLIC).is_err());
        assert!(validate_url("http://172.16.0.1/feed", PUBLIC).is_err());
        assert!(validate_url("http://169.254.1.1/feed", PUBLIC).is_err());
        assert!(validate_url("http://[fe80::1]/feed", PUBLIC).is_err());
        assert!(validate_url("http://0.0.0.0/feed", PUBLIC).is_err());
    }

    #[test]
    fn test_allow_private_accepts_loopback() {
        let url = validate_url("http://127.0.0.1:8080/feed", HostPolicy::AllowPrivate).unwrap();
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn test_resolve_relative_href() {
        let base = Url::parse("https://example.com/blog/post").unwrap();
        assert_eq!(resolve_href("/feed.xml", &base), "https://example.com/feed.xml");
        assert_eq!(resolve_href("rss", &base), "https://example.com/blog/rss");
    }

    #[test]
    fn test_resolve_absolute_and_protocol_relative_href() {
        let base = Url::parse("https://example.com/").unwrap();
        assert_eq!(
            resolve_href("http://feeds.example.org/rss", &base),
            "http://feeds.example.org/rss"
        );
        assert_eq!(
            resolve_href("//cdn.example.com/feed.xml", &base),
            "https://cdn.example.com/feed.xml"
        );
    }
}
