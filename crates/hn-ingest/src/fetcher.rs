//! Bounded-concurrency client for the item API
//!
//! Every request is admitted through one shared semaphore, so no more than
//! `concurrency` requests are ever in flight. A missing item is a normal
//! outcome. Transient failures are retried with linear backoff and then
//! downgraded to "absent" so the batch loop always makes progress.
//!
//! Cancellation is cooperative. The fetcher's token is a child of the caller's,
//! and it is checked at admission, around each request and before each
//! backoff sleep. A cancelled fetch resolves to `None`, never to an error.

use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::FetcherConfig;
use crate::error::{IngestError, Result};
use crate::item::Item;
use crate::progress::{self, ProgressReporter, SharedReporter};

const USER_AGENT: &str = concat!("hn-ingest/", env!("CARGO_PKG_VERSION"));

/// Anything the batch loop can pull items from
pub trait ItemSource: Send + Sync {
    /// Current upper bound of valid ids
    fn get_max_id(&self) -> impl Future<Output = Result<i64>> + Send;

    /// Resolve every id in `ids`, yielding results in completion order
    ///
    /// The stream ends early once the source is cancelled.
    fn fetch_items(&self, ids: Range<i64>) -> BoxStream<'_, (i64, Option<Item>)>;
}

/// Result of resolving one id, after retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Item),

    /// Not found, or a `null` body
    Absent,

    /// Retries exhausted on a timeout, connection error, 429 or 5xx
    Transient(String),

    /// Any other status, or a body that is not an item
    Rejected(String),

    Cancelled,
}

impl FetchOutcome {
    pub fn into_item(self) -> Option<Item> {
        match self {
            FetchOutcome::Found(item) => Some(item),
            _ => None,
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, FetchOutcome::Transient(_))
    }
}

/// Reports one physical attempt; the end event fires even if the request
/// future is dropped mid-flight.
struct ConnectionGuard<'a> {
    reporter: &'a dyn ProgressReporter,
}

impl<'a> ConnectionGuard<'a> {
    fn open(reporter: &'a dyn ProgressReporter) -> Self {
        reporter.connection_started();
        Self { reporter }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.reporter.connection_ended();
    }
}

/// Client for the Hacker News item API
pub struct HnFetcher {
    client: Client,
    config: FetcherConfig,
    gate: Arc<Semaphore>,
    cancel: CancellationToken,
    reporter: SharedReporter,
}

impl HnFetcher {
    /// Build the connection pool and admission gate
    ///
    /// `parent` cancels the fetcher; [`HnFetcher::shutdown`] cancels only the
    /// fetcher.
    pub fn connect(config: FetcherConfig, parent: &CancellationToken) -> Result<Self> {
        if config.concurrency == 0 {
            return Err(IngestError::config("concurrency must be greater than 0"));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(config.concurrency)
            .build()?;

        debug!(
            base_url = %config.base_url,
            concurrency = config.concurrency,
            "Fetcher connected"
        );

        Ok(Self {
            client,
            gate: Arc::new(Semaphore::new(config.concurrency)),
            cancel: parent.child_token(),
            reporter: progress::noop(),
            config,
        })
    }

    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Stop admitting requests and unwind in-flight ones. Safe to call twice.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Fetcher shutting down");
        }
        self.cancel.cancel();
        self.gate.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn max_id_url(&self) -> String {
        format!("{}/maxitem.json", self.config.base_url)
    }

    fn item_url(&self, id: i64) -> String {
        format!("{}/item/{id}.json", self.config.base_url)
    }

    /// Fetch the current max item id. Not retried.
    pub async fn get_max_id(&self) -> Result<i64> {
        let max_id = self
            .client
            .get(self.max_id_url())
            .send()
            .await?
            .error_for_status()?
            .json::<i64>()
            .await?;

        debug!(max_id, "Fetched max item id");
        Ok(max_id)
    }

    /// Fetch one item; `None` when absent, failed or cancelled
    pub async fn fetch_item(&self, id: i64) -> Option<Item> {
        match self.fetch_outcome(id).await {
            FetchOutcome::Found(item) => Some(item),
            FetchOutcome::Absent => {
                debug!(id, "Item absent");
                None
            },
            FetchOutcome::Transient(reason) => {
                warn!(
                    id,
                    attempts = self.config.max_retries + 1,
                    reason = %reason,
                    "Giving up on item after retries"
                );
                None
            },
            FetchOutcome::Rejected(reason) => {
                warn!(id, reason = %reason, "Item response rejected");
                None
            },
            FetchOutcome::Cancelled => None,
        }
    }

    /// Resolve one id, retrying transient failures
    pub async fn fetch_outcome(&self, id: i64) -> FetchOutcome {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return FetchOutcome::Cancelled,
            permit = self.gate.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return FetchOutcome::Cancelled,
            },
        };

        let url = self.item_url(id);
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return FetchOutcome::Cancelled,
                outcome = self.attempt(&url) => outcome,
            };

            if !outcome.is_transient() || attempt >= self.config.max_retries {
                return outcome;
            }

            attempt += 1;
            let delay = self.config.backoff(attempt);
            debug!(
                id,
                attempt,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return FetchOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }

    /// One physical request
    async fn attempt(&self, url: &str) -> FetchOutcome {
        let _connection = ConnectionGuard::open(self.reporter.as_ref());

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return FetchOutcome::Transient(e.to_string()),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return FetchOutcome::Absent;
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return FetchOutcome::Transient(format!("HTTP {status}"));
        }
        if !status.is_success() {
            return FetchOutcome::Rejected(format!("HTTP {status}"));
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return FetchOutcome::Transient(e.to_string()),
        };

        match serde_json::from_slice::<Option<Item>>(&body) {
            Ok(Some(item)) => FetchOutcome::Found(item),
            Ok(None) => FetchOutcome::Absent,
            Err(e) => FetchOutcome::Rejected(format!("undecodable body: {e}")),
        }
    }

    /// Resolve ids concurrently, in completion order
    pub fn fetch_items(&self, ids: Range<i64>) -> BoxStream<'_, (i64, Option<Item>)> {
        stream::iter(ids)
            .map(move |id| async move { (id, self.fetch_item(id).await) })
            .buffer_unordered(self.config.concurrency)
            .take_until(self.cancel.clone().cancelled_owned())
            .boxed()
    }
}

impl ItemSource for HnFetcher {
    fn get_max_id(&self) -> impl Future<Output = Result<i64>> + Send {
        HnFetcher::get_max_id(self)
    }

    fn fetch_items(&self, ids: Range<i64>) -> BoxStream<'_, (i64, Option<Item>)> {
        HnFetcher::fetch_items(self, ids)
    }
}

impl Drop for HnFetcher {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.gate.close();
    }
}
