//! Bridge from an async response body to a blocking reader.
//!
//! The XML parsers are synchronous and run under `spawn_blocking`. A pump
//! task pulls chunks from the response and sends them over a bounded channel;
//! [`BodyReader`] receives them with `blocking_recv`. Dropping the reader
//! aborts the pump, which drops the response and closes the connection.

use std::io::{self, BufRead, Read};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::transport::FetchedResponse;

/// Chunks buffered between the pump and the reader.
const CHANNEL_DEPTH: usize = 8;

enum Delivery {
    Data(Bytes),
    End,
    Failed(String),
}

/// Blocking view of a response body.
///
/// Must only be read from a thread where blocking is allowed.
pub struct BodyReader {
    rx: mpsc::Receiver<Delivery>,
    current: Bytes,
    finished: bool,
    pump: AbortHandle,
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader")
            .field("buffered", &self.current.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl BodyReader {
    pub(crate) fn spawn(mut response: FetchedResponse) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);

        let pump = tokio::spawn(async move {
            loop {
                let delivery = match response.next_chunk().await {
                    Ok(Some(chunk)) => Delivery::Data(chunk),
                    Ok(None) => Delivery::End,
                    Err(e) => Delivery::Failed(e.to_string()),
                };
                let last = !matches!(delivery, Delivery::Data(_));
                // A closed channel means the reader is gone
                if tx.send(delivery).await.is_err() || last {
                    break;
                }
            }
        });

        Self {
            rx,
            current: Bytes::new(),
            finished: false,
            pump: pump.abort_handle(),
        }
    }

    /// Waits until there is data buffered or the body is over.
    fn fill(&mut self) -> io::Result<()> {
        while self.current.is_empty() && !self.finished {
            match self.rx.blocking_recv() {
                Some(Delivery::Data(chunk)) => self.current = chunk,
                Some(Delivery::End) => self.finished = true,
                Some(Delivery::Failed(reason)) => {
                    self.finished = true;
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason));
                }
                // The pump went away without saying the body was complete
                None => {
                    self.finished = true;
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "body transfer stopped",
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill()?;
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current.advance(n);
        Ok(n)
    }
}

impl BufRead for BodyReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.fill()?;
        Ok(&self.current)
    }

    fn consume(&mut self, amt: usize) {
        self.current.advance(amt.min(self.current.len()));
    }
}

impl Drop for BodyReader {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::transport::Transport;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn fetch(body: Vec<u8>) -> (MockServer, FetchedResponse) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let transport = Transport::new("feedline-test", Duration::from_secs(5)).unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let response = transport.fetch(&url).await.unwrap();
        (server, response)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reads_whole_body() {
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let (_server, response) = fetch(body.clone()).await;

        let reader = response.into_reader();
        let read = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut out = Vec::new();
            reader.read_to_end(&mut out).map(|_| out)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(read, body);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_buf_read_lines() {
        let (_server, response) = fetch(b"one\ntwo\nthree".to_vec()).await;

        let reader = response.into_reader();
        let lines = tokio::task::spawn_blocking(move || {
            reader.lines().collect::<io::Result<Vec<_>>>()
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_read_then_drop() {
        let (_server, response) = fetch(vec![b'x'; 200_000]).await;

        let reader = response.into_reader();
        let first = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || {
                let mut reader = reader;
                let mut head = [0u8; 16];
                let n = reader.read(&mut head)?;
                drop(reader);
                Ok::<_, io::Error>(head[..n].to_vec())
            }),
        )
        .await
        .expect("reader blocked after drop")
        .unwrap()
        .unwrap();

        assert!(!first.is_empty());
        assert!(first.iter().all(|&b| b == b'x'));
    }
}
