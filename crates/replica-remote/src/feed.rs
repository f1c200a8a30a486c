//! WebSocket change feed.
//!
//! Connects to a feed that pushes JSON wire events as text frames and turns
//! them into a [`ChangeEventSource`]. Reconnects with exponential backoff
//! until the subscription is released.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use replica_cache::{ChangeEvent, ChangeEventSource, Subscription, SyncError, WireEvent};

/// Longest wait between reconnection attempts.
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Reconnect when the feed is silent for this long.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, SyncError>>;

/// Why a connection ended.
enum Disconnect {
    /// Unsubscribed, or nobody is listening anymore.
    Stop,
    /// Transport trouble; reconnect.
    Retry(String),
}

/// WebSocket change-feed client.
#[derive(Debug, Clone)]
pub struct FeedClient {
    /// Feed URL without query params.
    url: String,
    namespace: Option<String>,
    collections: Vec<String>,
}

impl FeedClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: None,
            collections: Vec::new(),
        }
    }

    /// Only receive events for `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Add a collection to the watch list. No collections means all of them.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        if !collection.is_empty() && !self.collections.contains(&collection) {
            self.collections.push(collection);
        }
        self
    }

    /// Build the full WebSocket URL with query parameters.
    fn build_url(&self) -> String {
        let mut url = self.url.clone();
        let mut first = !url.contains('?');
        let mut param = |name: &str, value: &str| {
            url.push(if first { '?' } else { '&' });
            first = false;
            url.push_str(name);
            url.push('=');
            url.push_str(value);
        };

        if let Some(namespace) = &self.namespace {
            param("namespace", namespace);
        }
        for collection in &self.collections {
            param("collection", collection);
        }
        url
    }

    /// Forward feed events into `events` until shutdown or until the
    /// receiving side goes away.
    pub async fn run(&self, events: EventSender, mut shutdown_rx: watch::Receiver<bool>) {
        let url = self.build_url();
        let mut backoff_secs = 1u64;

        loop {
            if *shutdown_rx.borrow() || events.is_closed() {
                break;
            }

            info!(url = %url, "connecting to change feed");
            let mut connected = false;
            match self
                .connect_and_process(&url, &events, &mut shutdown_rx, &mut connected)
                .await
            {
                Disconnect::Stop => break,
                Disconnect::Retry(reason) => {
                    if connected {
                        backoff_secs = 1;
                    }
                    error!(error = %reason, backoff_secs, "change feed connection error, reconnecting");

                    let wait = Duration::from_secs(backoff_secs);
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = events.closed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }

                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
        info!("change feed client stopped");
    }

    /// Connect and process frames until error or shutdown.
    async fn connect_and_process(
        &self,
        url: &str,
        events: &EventSender,
        shutdown_rx: &mut watch::Receiver<bool>,
        connected: &mut bool,
    ) -> Disconnect {
        let ws_stream = match connect_async(url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => return Disconnect::Retry(format!("connection failed: {}", e)),
        };
        let (_, mut read) = ws_stream.split();
        *connected = true;
        info!("change feed connected");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("change feed received shutdown signal");
                        return Disconnect::Stop;
                    }
                }

                _ = events.closed() => {
                    debug!("change feed receiver dropped");
                    return Disconnect::Stop;
                }

                result = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if let Some(item) = decode_frame(&text) {
                                if events.send(item).is_err() {
                                    return Disconnect::Stop;
                                }
                            }
                        }
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            // tungstenite auto-responds to pings
                            trace!("received ping");
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            info!("change feed closed by server");
                            return Disconnect::Retry("connection closed".to_string());
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Disconnect::Retry(format!("read error: {}", e));
                        }
                        Ok(None) => {
                            return Disconnect::Retry("stream ended".to_string());
                        }
                        Err(_) => {
                            warn!("change feed read timeout after {}s", READ_TIMEOUT.as_secs());
                            return Disconnect::Retry("read timeout".to_string());
                        }
                    }
                }
            }
        }
    }
}

/// Decode one text frame.
///
/// Frames that are not wire events at all are skipped. Wire events that do
/// not describe a valid change are passed on as errors.
fn decode_frame(text: &str) -> Option<Result<ChangeEvent, SyncError>> {
    let wire: WireEvent = match serde_json::from_str(text) {
        Ok(wire) => wire,
        Err(e) => {
            warn!(error = %e, "skipping undecodable change feed frame");
            return None;
        }
    };
    Some(ChangeEvent::try_from(wire))
}

impl ChangeEventSource for FeedClient {
    /// Spawn the feed task on the current tokio runtime.
    fn subscribe(&self) -> Result<Subscription, SyncError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Subscribe(format!("no tokio runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = self.clone();
        runtime.spawn(async move {
            client.run(tx, shutdown_rx).await;
        });

        Ok(Subscription::new(rx, move || {
            let _ = shutdown_tx.send(true);
        }))
    }
}
