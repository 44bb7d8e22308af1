//! Utility functions shared by discovery, ingestion and the CLI.
//!
//! - **URL handling**: input normalization, relative link resolution and
//!   SSRF-focused validation
//! - **Text processing**: markup flattening and control-character stripping
//!   for feed-supplied text, Unicode-aware truncation for terminal output
//! - **Tasks**: panic capture for spawned background sessions
//!
//! # Examples
//!
//! ```
//! use feedline::util::{clean_text, normalize_input, validate_url, HostPolicy};
//!
//! let url = normalize_input("example.com").unwrap();
//! assert!(validate_url(&url, HostPolicy::PublicOnly).is_ok());
//!
//! assert_eq!(clean_text(" <b>Breaking</b> news "), "Breaking news");
//! ```

mod task;
mod text;
mod url_validator;

pub use task::catch_task_panic;

pub use text::{clean_text, display_width, flatten_html, strip_control_chars, truncate_to_width};
pub use url_validator::{
    normalize_input, resolve_href, validate_url, HostPolicy, UrlValidationError,
};
