use std::{fmt, time::Duration};

use futures::{
    future::BoxFuture,
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, debug_span, warn, Instrument};
use typed_builder::TypedBuilder;

use super::{
    config::ReplayWindow,
    observation::{RawRecord, RoutedObservation},
    short::ShortIdExt,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Connect(String),
    Disconnected(String),
    /// The source has nothing more to deliver, ever.
    Closed,
    /// Gave up after this many consecutive failed connection attempts.
    Exhausted { attempts: u32 },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "could not connect: {}", e),
            TransportError::Disconnected(e) => write!(f, "connection lost: {}", e),
            TransportError::Closed => write!(f, "source closed"),
            TransportError::Exhausted { attempts } => {
                write!(f, "gave up after {} reconnection attempts", attempts)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// How the delivery context reconnects after losing its feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct RetryPolicy {
    #[builder(default = 5)]
    pub max_attempts: u32,
    /// Wait before the first reconnection. Doubles on every further attempt.
    #[builder(default = Duration::from_secs(1))]
    pub delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Wait before reconnection attempt `attempt`, counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub type LiveFeed = BoxStream<'static, Result<RawRecord, TransportError>>;

/// Anything that can hand over raw records: a bounded history for a replay
/// window, and a live feed.
///
/// Paging, authentication and wire decoding are the source's business.
/// `subscribe` may be called again after the feed ends or fails; returning
/// [`TransportError::Closed`] tells the caller there is nothing left.
pub trait EventSource: Send + 'static {
    fn history(
        &mut self,
        window: ReplayWindow,
    ) -> BoxFuture<'_, Result<Vec<RawRecord>, TransportError>>;

    fn subscribe(&mut self) -> BoxFuture<'_, Result<LiveFeed, TransportError>>;
}

/// What the delivery context sends to the scheduler.
#[derive(Debug)]
pub(crate) enum Delivery {
    Observation(RoutedObservation),
    Failed(TransportError),
}

/// Runs the delivery context until the source closes, the retry budget runs
/// out, or the receiving side goes away.
///
/// Records that fail validation are logged and dropped here; only valid
/// observations are ever sent on. A connection only counts as healthy once a
/// record has arrived on it, so a feed that fails straight after subscribing
/// still uses up the retry budget. If the source closes right after a
/// failure, that failure is reported instead of a clean end.
pub(crate) async fn deliver<S: EventSource>(
    mut source: S,
    policy: RetryPolicy,
    tx: mpsc::UnboundedSender<Delivery>,
) {
    let span = debug_span!("delivery");
    async move {
        let mut attempts = 0;
        let mut failure = None;
        loop {
            match source.subscribe().await {
                Ok(mut feed) => {
                    debug!("subscribed to live feed");
                    failure = None;
                    while let Some(item) = feed.next().await {
                        let record = match item {
                            Ok(record) => record,
                            Err(e) => {
                                warn!("live feed failed: {}", e);
                                failure = Some(e);
                                break;
                            }
                        };
                        attempts = 0;
                        match RoutedObservation::try_from(record) {
                            Ok(routed) => {
                                debug!("new event for {}", routed.device_id.short());
                                if tx.send(Delivery::Observation(routed)).is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("dropping malformed record: {}", e),
                        }
                    }
                }
                Err(TransportError::Closed) => {
                    match failure {
                        Some(e) => {
                            let _ = tx.send(Delivery::Failed(e));
                        }
                        None => debug!("source closed"),
                    }
                    return;
                }
                Err(e) => {
                    warn!("could not subscribe: {}", e);
                    failure = Some(e);
                }
            }

            attempts += 1;
            if attempts >= policy.max_attempts {
                let _ = tx.send(Delivery::Failed(TransportError::Exhausted { attempts }));
                return;
            }
            let delay = policy.backoff(attempts);
            warn!(
                "connection lost, reconnection attempt {}/{} in {:?}",
                attempts, policy.max_attempts, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
    .instrument(span)
    .await
}

/// An in-memory source: a fixed history and, optionally, a live batch that
/// is delivered once.
#[derive(Debug, Default, Clone)]
pub struct ReplayLog {
    history: Vec<RawRecord>,
    live: Option<Vec<RawRecord>>,
}

impl ReplayLog {
    pub fn new(history: Vec<RawRecord>) -> Self {
        Self {
            history,
            live: None,
        }
    }

    pub fn with_live(mut self, live: Vec<RawRecord>) -> Self {
        self.live = Some(live);
        self
    }
}

impl EventSource for ReplayLog {
    fn history(
        &mut self,
        window: ReplayWindow,
    ) -> BoxFuture<'_, Result<Vec<RawRecord>, TransportError>> {
        // records without a readable time are kept so validation can reject them
        let records = self
            .history
            .iter()
            .filter(|r| r.event_time().map_or(true, |t| window.contains(t)))
            .cloned()
            .collect();
        async move { Ok(records) }.boxed()
    }

    fn subscribe(&mut self) -> BoxFuture<'_, Result<LiveFeed, TransportError>> {
        let live = self.live.take();
        async move {
            match live {
                Some(records) => Ok(stream::iter(records.into_iter().map(Ok)).boxed()),
                None => Err(TransportError::Closed),
            }
        }
        .boxed()
    }
}

/// A live-only source fed through a channel. The feed ends when every
/// sender is dropped.
pub struct ChannelSource {
    rx: Option<mpsc::UnboundedReceiver<Result<RawRecord, TransportError>>>,
}

impl ChannelSource {
    pub fn channel() -> (mpsc::UnboundedSender<Result<RawRecord, TransportError>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx: Some(rx) })
    }
}

impl EventSource for ChannelSource {
    fn history(
        &mut self,
        _window: ReplayWindow,
    ) -> BoxFuture<'_, Result<Vec<RawRecord>, TransportError>> {
        async { Ok(Vec::new()) }.boxed()
    }

    fn subscribe(&mut self) -> BoxFuture<'_, Result<LiveFeed, TransportError>> {
        let rx = self.rx.take();
        async move {
            let rx = rx.ok_or(TransportError::Closed)?;
            let feed = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(feed.boxed())
        }
        .boxed()
    }
}
