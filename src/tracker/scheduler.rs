use std::{future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use tokio::{
    select,
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    config::{TrackingConfig, Windows},
    error::Error,
    history::Assignment,
    observation::RoutedObservation,
    sensor::{SensorTracker, TrackerState},
    short::ShortIdExt,
    source::{deliver, Delivery, EventSource, TransportError},
    timeline::DeviceTimeline,
    topology::{ConfigError, ZoneTopology},
};

/// What a tracker needs at a given scheduler step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Flush,
    FlushEmpty,
    Wait,
}

/// Published for every tick a tracker commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTick {
    pub device_id: String,
    /// index of the tick in the device's history
    pub tick: usize,
    pub time: DateTime<Utc>,
    pub assignment: Assignment,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub flushed: usize,
    pub emptied: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub steps: usize,
    pub dispatched: usize,
    pub dropped: usize,
    pub flushed: usize,
    pub emptied: usize,
}

/// Cursor for live operation. Anchored to the wall clock once and advanced
/// by the monotonic clock afterwards, so successive readings never go
/// backwards.
#[derive(Debug, Clone, Copy)]
pub struct LiveClock {
    origin: DateTime<Utc>,
    started: Instant,
}

impl LiveClock {
    pub fn start() -> Self {
        Self::anchored(Utc::now())
    }

    pub fn anchored(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin + elapsed
    }
}

/// Steps time forward and decides, per tracker, when buffered observations
/// become a tick.
///
/// The scheduler owns every tracker. In live mode the delivery context runs
/// in its own task and only talks to the scheduler through a channel, so
/// ingestion and commits never interleave on a tracker.
pub struct TrackingScheduler {
    trackers: Vec<SensorTracker>,
    routes: HashMap<String, usize>,
    config: TrackingConfig,
    windows: Windows,
    clock: Option<LiveClock>,
    commits: Option<mpsc::UnboundedSender<CommittedTick>>,
}

impl TrackingScheduler {
    pub fn new<I, S>(
        config: TrackingConfig,
        topology: Arc<ZoneTopology>,
        devices: I,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let windows = config.windows()?;
        let mut trackers = Vec::new();
        let mut routes = HashMap::new();
        for device in devices {
            let device = device.into();
            if routes.contains_key(&device) {
                return Err(ConfigError::DuplicateDevice { device });
            }
            routes.insert(device.clone(), trackers.len());
            trackers.push(SensorTracker::new(device, topology.clone()));
        }
        debug!("tracking {} devices", trackers.len());

        Ok(Self {
            trackers,
            routes,
            config,
            windows,
            clock: None,
            commits: None,
        })
    }

    /// Uses the given clock for live operation instead of starting one from
    /// the current time.
    pub fn with_clock(mut self, clock: LiveClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Returns a receiver that gets every committed tick from now on.
    pub fn subscribe_commits(&mut self) -> mpsc::UnboundedReceiver<CommittedTick> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commits = Some(tx);
        rx
    }

    pub fn trackers(&self) -> &[SensorTracker] {
        &self.trackers
    }

    pub fn tracker(&self, device: &str) -> Option<&SensorTracker> {
        self.routes.get(device).map(|&i| &self.trackers[i])
    }

    pub fn timelines(&self) -> Vec<DeviceTimeline> {
        self.trackers.iter().map(DeviceTimeline::from_tracker).collect()
    }

    /// Hands an observation to the tracker of its device. Returns false if
    /// no tracker exists for that device.
    pub fn dispatch(&mut self, routed: RoutedObservation) -> bool {
        match self.routes.get(&routed.device_id) {
            Some(&i) => {
                self.trackers[i].ingest(routed.observation);
                true
            }
            None => {
                trace!("no tracker for device {}", routed.device_id.short());
                false
            }
        }
    }

    fn action(&self, tracker: &SensorTracker, now: DateTime<Utc>) -> TickAction {
        // never heard from counts as timed out
        let quiet = tracker.last_event_time().map(|t| now - t);
        if tracker.state() == TrackerState::Buffering
            && tracker.buffered() > 0
            && quiet.map_or(false, |q| q > self.windows.settle)
        {
            TickAction::Flush
        } else if quiet.map_or(true, |q| q > self.windows.timeout) {
            TickAction::FlushEmpty
        } else {
            TickAction::Wait
        }
    }

    /// Runs one scheduler step at `now` over every tracker.
    pub fn evaluate(&mut self, now: DateTime<Utc>) -> Evaluation {
        let mut evaluation = Evaluation::default();
        for i in 0..self.trackers.len() {
            let action = self.action(&self.trackers[i], now);
            let tracker = &mut self.trackers[i];
            let committed = match action {
                TickAction::Flush => tracker.flush(now).map(|assignment| {
                    evaluation.flushed += 1;
                    assignment
                }),
                TickAction::FlushEmpty => tracker.flush_empty(now).map(|_| {
                    evaluation.emptied += 1;
                    Assignment::NoData
                }),
                TickAction::Wait => continue,
            };
            let assignment = match committed {
                Ok(assignment) => assignment,
                Err(e) => {
                    warn!("skipping tick for device {}: {}", tracker.device_id().short(), e);
                    continue;
                }
            };
            trace!(
                "device {} committed tick {} as {:?}",
                tracker.device_id().short(),
                tracker.history().tick_count() - 1,
                assignment
            );

            let receiver_gone = match &self.commits {
                Some(commits) => commits
                    .send(CommittedTick {
                        device_id: tracker.device_id().to_string(),
                        tick: tracker.history().tick_count() - 1,
                        time: now,
                        assignment,
                    })
                    .is_err(),
                None => false,
            };
            if receiver_gone {
                self.commits = None;
            }
        }
        evaluation
    }

    /// Replays a bounded set of observations on a simulated clock.
    ///
    /// The cursor starts at the earliest observation and advances one tick at
    /// a time until it passes the latest. Before each step, every observation
    /// strictly older than the cursor is dispatched. Observations stamped at
    /// the final cursor position are dispatched after the last step and stay
    /// buffered, so a following live run picks them up.
    pub fn run_replay(&mut self, mut observations: Vec<RoutedObservation>) -> ReplayReport {
        let span = debug_span!("replay");
        let _guard = span.enter();
        let mut report = ReplayReport::default();

        if let Some(window) = self.config.replay {
            observations.retain(|o| window.contains(o.observation.event_time));
        }
        observations.sort_by_key(|o| o.observation.event_time);

        let (first, last) = match (observations.first(), observations.last()) {
            (Some(first), Some(last)) => {
                (first.observation.event_time, last.observation.event_time)
            }
            _ => {
                warn!("no events to replay");
                return report;
            }
        };

        let span_ns = (last - first).to_std().unwrap_or_default().as_nanos();
        let steps = span_ns / self.config.tick.as_nanos() + 1;
        let steps = usize::try_from(steps).unwrap_or(usize::MAX);
        for tracker in &mut self.trackers {
            tracker.reserve(steps);
        }
        debug!("replaying {} events over {} steps", observations.len(), steps);

        let mut pending = observations.into_iter().peekable();
        let mut now = first;
        while now <= last {
            while let Some(routed) = pending.next_if(|o| o.observation.event_time < now) {
                if self.dispatch(routed) {
                    report.dispatched += 1;
                } else {
                    report.dropped += 1;
                }
            }
            let evaluation = self.evaluate(now);
            report.flushed += evaluation.flushed;
            report.emptied += evaluation.emptied;
            report.steps += 1;
            now = now + self.windows.tick;
        }

        for routed in pending {
            if self.dispatch(routed) {
                report.dispatched += 1;
            } else {
                report.dropped += 1;
            }
        }

        info!(
            "replay done: {} steps, {} events dispatched, {} dropped, {} ticks flushed, {} empty",
            report.steps, report.dispatched, report.dropped, report.flushed, report.emptied
        );
        report
    }

    /// Tracks the source's live feed until `shutdown` resolves or the feed
    /// closes.
    ///
    /// Observations are dispatched in the order they come off the channel,
    /// and the channel is drained before a tick is evaluated. An observation
    /// still in flight when a tick fires lands in that tick or the next one.
    pub async fn run_live<S, F>(&mut self, source: S, shutdown: F) -> Result<(), TransportError>
    where
        S: EventSource,
        F: Future<Output = ()>,
    {
        let span = debug_span!("live");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let delivery = tokio::spawn(deliver(source, self.config.retry, tx));
        let clock = self.clock.unwrap_or_else(LiveClock::start);

        let result = async {
            let mut interval = tokio::time::interval(self.config.tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tokio::pin!(shutdown);
            debug!("listening for events");

            loop {
                select! {
                    biased;
                    _ = &mut shutdown => {
                        debug!("shutting down");
                        return Ok(());
                    }
                    msg = rx.recv() => match msg {
                        Some(Delivery::Observation(routed)) => {
                            self.dispatch(routed);
                        }
                        Some(Delivery::Failed(e)) => return Err(e),
                        None => {
                            debug!("live feed closed");
                            return Ok(());
                        }
                    },
                    _ = interval.tick() => {
                        self.evaluate(clock.now());
                    }
                }
            }
        }
        .instrument(span)
        .await;

        delivery.abort();
        result
    }

    /// Replays the configured history window, if any, then goes live on the
    /// same trackers.
    pub async fn run<S, F>(&mut self, mut source: S, shutdown: F) -> Result<ReplayReport, Error>
    where
        S: EventSource,
        F: Future<Output = ()>,
    {
        let mut report = ReplayReport::default();
        if let Some(window) = self.config.replay {
            let records = source.history(window).await?;
            let observations = records
                .into_iter()
                .filter_map(|record| match RoutedObservation::try_from(record) {
                    Ok(routed) => Some(routed),
                    Err(e) => {
                        warn!("dropping malformed record: {}", e);
                        None
                    }
                })
                .collect();
            report = self.run_replay(observations);
        }
        self.run_live(source, shutdown).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use futures::future::BoxFuture;

    use super::*;
    use crate::tracker::{
        config::ReplayWindow,
        observation::{FlatRecord, RawRecord},
        source::{ChannelSource, LiveFeed, ReplayLog, RetryPolicy},
        topology::ZoneSpec,
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
    }

    fn seen(device: &str, connector: &str, rssi: i32, secs: i64) -> RoutedObservation {
        RoutedObservation::new(device, connector, rssi, at(secs))
    }

    fn topology() -> Arc<ZoneTopology> {
        Arc::new(
            ZoneTopology::new(vec![
                ZoneSpec::new("z0", ["a", "b"]),
                ZoneSpec::new("z1", ["c"]),
            ])
            .unwrap(),
        )
    }

    fn config() -> TrackingConfig {
        TrackingConfig::builder()
            .tick(Duration::from_secs(1))
            .settle(Duration::from_secs(2))
            .timeout(Duration::from_secs(30))
            .build()
    }

    fn scheduler(devices: &[&str]) -> TrackingScheduler {
        TrackingScheduler::new(config(), topology(), devices.iter().copied()).unwrap()
    }

    #[test]
    fn refuses_duplicate_devices() {
        let result = TrackingScheduler::new(config(), topology(), ["d", "d"]);
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateDevice { device }) if device == "d"
        ));
    }

    #[test]
    fn refuses_invalid_config() {
        let config = TrackingConfig::builder().tick(Duration::ZERO).build();
        assert!(matches!(
            TrackingScheduler::new(config, topology(), ["d"]),
            Err(ConfigError::ZeroTick)
        ));
    }

    #[test]
    fn routes_by_device() {
        let mut s = scheduler(&["d1", "d2"]);
        assert!(s.dispatch(seen("d2", "a", 10, 0)));
        assert!(!s.dispatch(seen("ghost", "a", 10, 0)));
        assert_eq!(s.tracker("d1").unwrap().buffered(), 0);
        assert_eq!(s.tracker("d2").unwrap().buffered(), 1);
    }

    #[test]
    fn flushes_after_settle_and_empties_after_timeout() {
        let mut s = scheduler(&["d"]);
        s.dispatch(seen("d", "a", 50, 0));

        // settle has not passed yet
        assert_eq!(s.evaluate(at(2)), Evaluation::default());
        assert_eq!(
            s.evaluate(at(3)),
            Evaluation {
                flushed: 1,
                emptied: 0
            }
        );
        // inside the timeout nothing happens
        assert_eq!(s.evaluate(at(30)), Evaluation::default());
        assert_eq!(
            s.evaluate(at(31)),
            Evaluation {
                flushed: 0,
                emptied: 1
            }
        );
        // and past it every step commits an empty tick
        assert_eq!(s.evaluate(at(32)).emptied, 1);

        let h = s.tracker("d").unwrap().history();
        assert_eq!(
            h.assignments(),
            &[
                Assignment::NoData,
                Assignment::Known(0),
                Assignment::NoData,
                Assignment::NoData
            ]
        );
        assert_eq!(h.timestamps()[1..], [at(3), at(31), at(32)]);
    }

    #[test]
    fn silent_devices_time_out_immediately() {
        let mut s = scheduler(&["d"]);
        assert_eq!(s.evaluate(at(0)).emptied, 1);
        assert_eq!(s.tracker("d").unwrap().history().tick_count(), 2);
    }

    #[test]
    fn commits_are_published() {
        let mut s = scheduler(&["d"]);
        let mut commits = s.subscribe_commits();
        s.dispatch(seen("d", "c", 50, 0));
        s.evaluate(at(5));

        assert_eq!(
            commits.try_recv().unwrap(),
            CommittedTick {
                device_id: "d".into(),
                tick: 1,
                time: at(5),
                assignment: Assignment::Known(1),
            }
        );
        assert!(commits.try_recv().is_err());
    }

    #[test]
    fn replay_walks_the_observation_span() {
        let mut s = scheduler(&["d", "quiet"]);
        let report = s.run_replay(vec![
            seen("d", "c", 40, 10),
            seen("d", "a", 70, 0),
            seen("ghost", "a", 1, 4),
            seen("d", "b", 20, 1),
        ]);

        // cursor at 0, 1, ..., 10
        assert_eq!(report.steps, 11);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.dispatched, 3);

        let d = s.tracker("d").unwrap();
        let h = d.history();
        // step 0 is before anything is dispatched, so the silent device and
        // d both commit an empty tick; a and b settle into one tick at 4
        assert_eq!(h.timestamps()[1..], [at(0), at(4)]);
        assert_eq!(h.assignments()[2], Assignment::Known(0));
        assert_eq!(h.row("a").unwrap().rssi(), &[0, 0, 70]);
        assert_eq!(h.row("b").unwrap().rssi(), &[0, 0, 20]);

        // the observation at the very end stays buffered
        assert_eq!(d.buffered(), 1);
        assert_eq!(d.state(), TrackerState::Buffering);

        // the silent device times out on every step
        let quiet = s.tracker("quiet").unwrap().history();
        assert_eq!(quiet.tick_count(), 12);
    }

    #[test]
    fn replay_respects_window() {
        let config = TrackingConfig::builder()
            .settle(Duration::from_secs(2))
            .timeout(Duration::from_secs(30))
            .replay(ReplayWindow {
                start: at(5),
                end: at(20),
            })
            .build();
        let mut s = TrackingScheduler::new(config, topology(), ["d"]).unwrap();
        let report = s.run_replay(vec![
            seen("d", "a", 1, 0),
            seen("d", "a", 1, 6),
            seen("d", "a", 1, 9),
            seen("d", "a", 1, 25),
        ]);
        assert_eq!(report.steps, 4);
        assert_eq!(report.dispatched, 2);
    }

    #[test]
    fn empty_replay_does_nothing() {
        let mut s = scheduler(&["d"]);
        assert_eq!(s.run_replay(Vec::new()), ReplayReport::default());
        assert_eq!(s.tracker("d").unwrap().history().tick_count(), 1);
    }

    fn raw(device: &str, connector: &str, rssi: i64, time: DateTime<Utc>) -> RawRecord {
        RawRecord::Flat(FlatRecord {
            target_device_id: Some(device.into()),
            connector_id: Some(connector.into()),
            signal_strength: Some(rssi),
            event_time: Some(time.to_rfc3339()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn live_ticks_follow_the_clock() {
        let clock = LiveClock::anchored(at(0));
        let mut s = scheduler(&["d"]).with_clock(clock);
        let mut commits = s.subscribe_commits();
        let (tx, source) = ChannelSource::channel();

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100_500)).await;
            tx.send(Ok(raw("d", "a", -50, clock.now()))).unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(Ok(raw("d", "b", -60, clock.now()))).unwrap();
            // keep the feed open past shutdown
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(tx);
        });

        s.run_live(source, tokio::time::sleep(Duration::from_secs(140)))
            .await
            .unwrap();
        feeder.abort();

        let h = s.tracker("d").unwrap().history();
        let secs = |t: &DateTime<Utc>| t.timestamp() - at(0).timestamp();
        let flushed: Vec<_> = h
            .assignments()
            .iter()
            .zip(h.timestamps())
            .filter(|(a, _)| a.has_data())
            .map(|(a, t)| (secs(t), *a))
            .collect();
        // last observation at 101s and a 2s settle window: the first step
        // strictly more than 2s later is at 104s
        assert_eq!(flushed, vec![(104, Assignment::Known(0))]);

        let tick = h.assignments().iter().position(|a| a.has_data()).unwrap();
        let row_a = h.row("a").unwrap().rssi();
        let row_b = h.row("b").unwrap().rssi();
        assert_eq!((row_a[tick], row_b[tick]), (-50, -60));

        // never heard from: one empty tick per step up to the first event
        assert_eq!(h.assignments()[1], Assignment::NoData);
        assert_eq!(secs(&h.timestamps()[1]), 0);
        assert_eq!(secs(&h.timestamps()[tick - 1]), 100);
        // after the flush, empty ticks resume once more than 30s have passed
        // since the last observation
        assert_eq!(secs(&h.timestamps()[tick + 1]), 132);
        assert_eq!(secs(h.timestamps().last().unwrap()), 139);
        assert_eq!(h.check_invariants(), Ok(()));

        let mut published = 0;
        while commits.try_recv().is_ok() {
            published += 1;
        }
        assert_eq!(published, h.tick_count() - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn live_stops_when_the_feed_closes() {
        let mut s = scheduler(&["d"]);
        let (tx, source) = ChannelSource::channel();
        drop(tx);
        s.run_live(source, std::future::pending()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn live_surfaces_a_feed_that_fails_then_closes() {
        let mut s = scheduler(&["d"]);
        let (tx, source) = ChannelSource::channel();
        tx.send(Err(TransportError::Disconnected("read error".into())))
            .unwrap();
        drop(tx);
        assert_eq!(
            s.run_live(source, std::future::pending()).await,
            Err(TransportError::Disconnected("read error".into()))
        );
    }

    struct Refusing;

    impl EventSource for Refusing {
        fn history(
            &mut self,
            _window: ReplayWindow,
        ) -> BoxFuture<'_, Result<Vec<RawRecord>, TransportError>> {
            Box::pin(async { Err(TransportError::Connect("refused".into())) })
        }

        fn subscribe(&mut self) -> BoxFuture<'_, Result<LiveFeed, TransportError>> {
            Box::pin(async { Err(TransportError::Connect("refused".into())) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_source_is_fatal() {
        let config = TrackingConfig::builder()
            .retry(RetryPolicy::builder().max_attempts(2).build())
            .build();
        let mut s = TrackingScheduler::new(config, topology(), ["d"]).unwrap();
        assert_eq!(
            s.run_live(Refusing, std::future::pending()).await,
            Err(TransportError::Exhausted { attempts: 2 })
        );
    }

    #[tokio::test]
    async fn failed_history_fetch_is_surfaced() {
        let config = TrackingConfig::builder()
            .replay(ReplayWindow {
                start: at(0),
                end: at(10),
            })
            .build();
        let mut s = TrackingScheduler::new(config, topology(), ["d"]).unwrap();
        assert!(matches!(
            s.run(Refusing, std::future::pending()).await,
            Err(Error::Transport(TransportError::Connect(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_replays_then_goes_live() {
        let config = TrackingConfig::builder()
            .settle(Duration::from_secs(2))
            .timeout(Duration::from_secs(30))
            .replay(ReplayWindow {
                start: at(0),
                end: at(100),
            })
            .build();
        let mut s = TrackingScheduler::new(config, topology(), ["d"])
            .unwrap()
            .with_clock(LiveClock::anchored(at(1000)));
        let source = ReplayLog::new(vec![
            raw("d", "a", 30, at(0)),
            raw("d", "c", 90, at(10)),
        ])
        .with_live(Vec::new());

        let report = s.run(source, std::future::pending()).await.unwrap();
        assert_eq!(report.dispatched, 2);

        let h = s.tracker("d").unwrap().history();
        // heard at 0, so the first step more than 2s later is at 3
        assert_eq!(h.assignments()[2], Assignment::Known(0));
        assert_eq!(h.timestamps()[2], at(3));
        // the observation at the end of the replay stayed buffered and is
        // committed by the first live step
        assert_eq!(h.timestamps()[3], at(1000));
        assert_eq!(h.assignments()[3], Assignment::Known(1));
    }
}
