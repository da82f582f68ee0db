use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zonewatch::tracker::{
    short::ShortIdExt,
    source::ChannelSource,
    timeline::zone_label,
    ConfigError, Error, RawRecord, ReplayWindow, RoutedObservation, TrackingConfig,
    TrackingScheduler, TransportError, ZoneTopology,
};

/// Infers which zone each tracked asset is in from the cloud connectors that
/// hear it best.
#[derive(Parser, Debug)]
struct Args {
    /// JSON file with the zones and the connectors installed in each.
    #[arg(long)]
    zones: PathBuf,
    /// Device to track; repeat for several. Defaults to every device in the
    /// event history.
    #[arg(long = "device")]
    devices: Vec<String>,
    /// Event history to replay, one JSON record per line.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Start of the replay window (RFC 3339). Defaults to the first event.
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// End of the replay window (RFC 3339). Defaults to the last event.
    #[arg(long)]
    end: Option<DateTime<Utc>>,
    /// Scheduler step in seconds.
    #[arg(long, default_value_t = 1.0)]
    tick: f64,
    /// Seconds of quiet before buffered observations are committed.
    #[arg(long, default_value_t = 5.0)]
    settle: f64,
    /// Seconds before an asset is considered between zones.
    #[arg(long, default_value_t = 1800.0)]
    timeout: f64,
    /// After the replay, keep tracking records streamed on stdin.
    #[arg(long)]
    live: bool,
    /// Print timelines as JSON instead of a span summary.
    #[arg(long)]
    json: bool,
}

fn seconds(secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::DurationOutOfRange)
}

fn read_history(path: &Path) -> Result<Vec<RawRecord>, Error> {
    let mut records = Vec::new();
    for (n, line) in fs::read_to_string(path)?.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match RawRecord::from_json(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("skipping line {} of {}: {}", n + 1, path.display(), e),
        }
    }
    Ok(records)
}

fn stream_stdin() -> ChannelSource {
    let (tx, source) = ChannelSource::channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match RawRecord::from_json(&line) {
                    Ok(record) => {
                        if tx.send(Ok(record)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("skipping input line: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(TransportError::Disconnected(e.to_string())));
                    break;
                }
            }
        }
    });
    source
}

async fn run(args: Args) -> Result<(), Error> {
    let topology = Arc::new(ZoneTopology::from_json(&fs::read_to_string(&args.zones)?)?);
    info!(
        "loaded {} zones with {} connectors",
        topology.zone_count(),
        topology.connectors().count()
    );

    let history = match &args.events {
        Some(path) => read_history(path)?,
        None => Vec::new(),
    };

    let mut observations = Vec::new();
    for record in history {
        match RoutedObservation::try_from(record) {
            Ok(routed) => observations.push(routed),
            Err(e) => warn!("dropping malformed record: {}", e),
        }
    }

    let mut devices = args.devices.clone();
    if devices.is_empty() {
        for routed in &observations {
            if !devices.contains(&routed.device_id) {
                devices.push(routed.device_id.clone());
            }
        }
    }
    if devices.is_empty() {
        warn!("no devices to track");
    }

    let mut config = TrackingConfig::builder()
        .tick(seconds(args.tick)?)
        .settle(seconds(args.settle)?)
        .timeout(seconds(args.timeout)?)
        .build();
    let times = observations.iter().map(|o| o.observation.event_time);
    if let (Some(first), Some(last)) = (times.clone().min(), times.max()) {
        config.replay = Some(ReplayWindow {
            start: args.start.unwrap_or(first),
            end: args.end.unwrap_or(last),
        });
    }

    let mut scheduler = TrackingScheduler::new(config, topology.clone(), devices)?;
    scheduler.run_replay(observations);

    if args.live {
        let mut commits = scheduler.subscribe_commits();
        let labels = topology.clone();
        tokio::spawn(async move {
            while let Some(tick) = commits.recv().await {
                info!(
                    "{} {} -> {}",
                    tick.time.format("%H:%M:%S"),
                    tick.device_id.short(),
                    zone_label(&labels, tick.assignment)
                );
            }
        });

        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        scheduler.run_live(stream_stdin(), shutdown).await?;
    }

    for tracker in scheduler.trackers() {
        tracker.history().check_invariants()?;
    }

    for timeline in scheduler.timelines() {
        if args.json {
            match serde_json::to_string(&timeline) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("could not encode timeline for {}: {}", timeline.device_id, e),
            }
            continue;
        }
        println!("device {}", timeline.device_id);
        for span in &timeline.spans {
            println!(
                "  {} .. {}  {} ({} ticks)",
                span.start.to_rfc3339(),
                span.end.to_rfc3339(),
                zone_label(&topology, span.assignment),
                span.ticks
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
