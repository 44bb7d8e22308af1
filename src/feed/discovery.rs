use std::borrow::Cow;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::header::{self, HeaderError};
use super::link_scanner::find_feed_link;
use super::transport::{FetchedResponse, Transport, TransportError};
use super::{FeedRecord, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::events::FeedEvent;
use crate::util::{
    catch_task_panic, normalize_input, resolve_href, validate_url, HostPolicy, UrlValidationError,
};

/// Where a discovery session is.
///
/// Sessions move strictly forward: `Unknown → Discovery → ParseHeader →
/// Terminal`. Failures jump straight to `Terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Unknown,
    /// Fetching the user's URL and deciding what it is.
    Discovery,
    /// Reading the channel header of a feed body.
    ParseHeader,
    Terminal,
}

/// Errors that can occur during feed discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Nothing was typed
    #[error("URL is empty")]
    EmptyInput,
    /// The URL failed validation (SSRF, bad scheme, etc.)
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] UrlValidationError),
    /// The page was too short to hold a feed link
    #[error("Empty Page")]
    EmptyPage,
    /// The page had no usable autodiscovery link
    #[error("feed not found")]
    FeedNotFound,
    /// HTTP request failed
    #[error("Network error: {0}")]
    Network(#[from] TransportError),
    /// The feed body stopped arriving while its header was read
    #[error("Connection interrupted: {0}")]
    Interrupted(String),
    /// The feed is not well-formed XML
    #[error("Parse error: {0}")]
    Parse(String),
    /// The operation does not apply to the session's current state
    #[error("Cannot {action} while in state {state:?}")]
    InvalidState {
        action: &'static str,
        state: DiscoveryState,
    },
}

impl DiscoveryError {
    /// Network trouble, as opposed to a problem with the input or the page.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DiscoveryError::Network(_) | DiscoveryError::Interrupted(_)
        )
    }
}

impl From<HeaderError> for DiscoveryError {
    fn from(err: HeaderError) -> Self {
        match err {
            HeaderError::Interrupted(reason) => DiscoveryError::Interrupted(reason),
            HeaderError::Xml(reason) => DiscoveryError::Parse(reason),
        }
    }
}

/// One attempt to resolve user input into a feed.
///
/// Owns all of its state; two sessions never share anything but the
/// transport's connection pool. A session runs once; see [`AddFeedSession`]
/// for resubmission.
#[derive(Debug)]
pub struct DiscoverySession {
    transport: Transport,
    policy: HostPolicy,
    events: Option<(mpsc::Sender<FeedEvent>, u64)>,
    state: DiscoveryState,
    history: Vec<DiscoveryState>,
}

impl DiscoverySession {
    pub fn new(transport: Transport, policy: HostPolicy) -> Self {
        Self {
            transport,
            policy,
            events: None,
            state: DiscoveryState::Unknown,
            history: vec![DiscoveryState::Unknown],
        }
    }

    /// Sends status messages to `events`, tagged with `generation`.
    pub fn with_events(mut self, events: mpsc::Sender<FeedEvent>, generation: u64) -> Self {
        self.events = Some((events, generation));
        self
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Every state visited so far, in order, starting with `Unknown`.
    pub fn history(&self) -> &[DiscoveryState] {
        &self.history
    }

    /// Resolves `input` to a feed.
    ///
    /// Bare hosts get `http://` prepended. If the first response is XML it is
    /// read as the feed; otherwise up to [`MAX_PAGE_SIZE`] bytes of it are
    /// scanned for an autodiscovery link, which is then fetched instead.
    /// Nothing is retried. The session ends in `Terminal` either way.
    ///
    /// # Errors
    ///
    /// Any [`DiscoveryError`]; [`DiscoveryError::InvalidState`] if the
    /// session has already run.
    pub async fn run(&mut self, input: &str) -> Result<FeedRecord, DiscoveryError> {
        if self.state != DiscoveryState::Unknown {
            return Err(DiscoveryError::InvalidState {
                action: "start discovery",
                state: self.state,
            });
        }

        let result = self.resolve(input).await;
        self.enter(DiscoveryState::Terminal);

        match &result {
            Ok(feed) => tracing::info!(url = %feed.url, title = %feed.title, "Feed resolved"),
            Err(e) => tracing::info!(input = %input, error = %e, "Discovery failed"),
        }
        result
    }

    async fn resolve(&mut self, input: &str) -> Result<FeedRecord, DiscoveryError> {
        let normalized = normalize_input(input).ok_or(DiscoveryError::EmptyInput)?;
        let url = validate_url(&normalized, self.policy)?;

        self.enter(DiscoveryState::Discovery);
        self.status(format!("Requesting {url}")).await;
        let response = self.transport.fetch(&url).await?;
        self.status(format!("Connected to {}", response.meta().host))
            .await;

        let feed_response = if response.meta().is_xml() {
            response
        } else {
            let feed_url = self.discover(response).await?;
            self.status(format!("Requesting {feed_url}")).await;
            self.transport.fetch(&feed_url).await?
        };

        self.enter(DiscoveryState::ParseHeader);
        self.read_header(feed_response).await
    }

    /// Buffers a page and finds the feed it links to.
    async fn discover(&self, response: FetchedResponse) -> Result<Url, DiscoveryError> {
        let base = response.meta().final_url.clone();
        let page = read_page(response).await?;

        if page.len() < MIN_PAGE_SIZE {
            tracing::debug!(url = %base, bytes = page.len(), "Page too short to scan");
            return Err(DiscoveryError::EmptyPage);
        }

        let html: Cow<'_, str> = String::from_utf8_lossy(&page);
        let link = find_feed_link(&html).ok_or(DiscoveryError::FeedNotFound)?;
        let resolved = resolve_href(link.href(), &base);
        tracing::debug!(page = %base, href = %link.href(), resolved = %resolved, "Found feed link");

        Ok(validate_url(&resolved, self.policy)?)
    }

    async fn read_header(&self, response: FetchedResponse) -> Result<FeedRecord, DiscoveryError> {
        let meta = response.meta().clone();
        self.status(format!("Parsing {}", meta.final_url)).await;

        let reader = response.into_reader();
        let record = tokio::task::spawn_blocking(move || {
            header::parse_header(reader, meta.final_url.as_str(), &meta.host)
        })
        .await
        .map_err(|e| DiscoveryError::Parse(format!("header parser failed: {e}")))??;

        Ok(record)
    }

    fn enter(&mut self, next: DiscoveryState) {
        tracing::trace!(from = ?self.state, to = ?next, "Discovery transition");
        self.state = next;
        self.history.push(next);
    }

    async fn status(&self, message: String) {
        tracing::info!("{message}");
        if let Some((tx, generation)) = &self.events {
            // A dropped receiver only means nobody is watching
            let _ = tx
                .send(FeedEvent::DiscoveryStatus {
                    generation: *generation,
                    message,
                })
                .await;
        }
    }
}

/// Reads at most [`MAX_PAGE_SIZE`] bytes of a page.
///
/// Stops pulling as soon as the cap is passed; dropping the response then
/// closes the connection.
async fn read_page(mut response: FetchedResponse) -> Result<Vec<u8>, TransportError> {
    let mut page = Vec::with_capacity(MAX_PAGE_SIZE);

    while let Some(chunk) = response.next_chunk().await? {
        page.extend_from_slice(&chunk);
        if page.len() > MAX_PAGE_SIZE {
            tracing::debug!(url = %response.meta().final_url, "Page cap reached, cancelling");
            break;
        }
    }

    page.truncate(MAX_PAGE_SIZE);
    Ok(page)
}

/// The add-feed entry point held by the event loop.
///
/// Each [`submit`](Self::submit) starts a fresh [`DiscoverySession`] on its
/// own task, aborting the previous one, and bumps the generation. Results
/// arrive as [`FeedEvent`]s; events from older generations are stale.
pub struct AddFeedSession {
    transport: Transport,
    policy: HostPolicy,
    events: mpsc::Sender<FeedEvent>,
    generation: u64,
    inflight: Option<JoinHandle<()>>,
}

impl AddFeedSession {
    pub fn new(transport: Transport, policy: HostPolicy, events: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            transport,
            policy,
            events,
            generation: 0,
            inflight: None,
        }
    }

    /// Generation of the most recent submission.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    /// Starts discovery for `input`.
    ///
    /// Blank input is ignored and returns `None`. Otherwise the previous
    /// session is aborted and the new generation returned.
    pub fn submit(&mut self, input: &str) -> Option<u64> {
        if input.trim().is_empty() {
            tracing::debug!("Ignoring empty feed URL");
            return None;
        }

        self.cancel();
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;

        let tx = self.events.clone();
        let mut session = DiscoverySession::new(self.transport.clone(), self.policy)
            .with_events(tx.clone(), generation);
        let input = input.to_owned();

        self.inflight = Some(tokio::spawn(async move {
            let event = match catch_task_panic(session.run(&input)).await {
                Ok(Ok(feed)) => FeedEvent::FeedResolved { generation, feed },
                Ok(Err(e)) if e.is_network() => FeedEvent::NetworkError {
                    generation,
                    error: e.to_string(),
                },
                Ok(Err(e)) => FeedEvent::DiscoveryFailed {
                    generation,
                    message: e.to_string(),
                },
                Err(panic_msg) => {
                    tracing::error!(error = %panic_msg, "Discovery task panicked");
                    FeedEvent::DiscoveryFailed {
                        generation,
                        message: format!("internal error: {panic_msg}"),
                    }
                }
            };
            let _ = tx.send(event).await;
        }));

        Some(generation)
    }

    /// Aborts the in-flight session, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.inflight.take() {
            handle.abort();
            tracing::debug!(generation = self.generation, "Aborted previous discovery");
        }
    }
}

impl Drop for AddFeedSession {
    fn drop(&mut self) {
        self.cancel();
    }
}
