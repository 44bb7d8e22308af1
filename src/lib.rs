//! Resolve any URL to its RSS/Atom feed, then stream and store the feed's items.
//!
//! - [`feed`] - discovery, header parsing, item ingestion and refresh sessions
//! - [`storage`] - SQLite persistence for feeds and items
//! - [`events`] - messages from background sessions to the event loop
//! - [`app`] - the event loop's state and handlers
//! - [`config`] - optional TOML configuration
//! - [`util`] - text cleanup, URL validation, panic capture

pub mod app;
pub mod config;
pub mod events;
pub mod feed;
pub mod storage;
pub mod util;
