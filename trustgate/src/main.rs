// trustgate/src/main.rs
//
// Trustgate — account-sharing detection and generation quotas, driven from a
// JSONL event stream.
//
// Two operational modes:
//   tail    — follow a live JSONL stream written by the web tier
//   replay  — replay a captured stream at scaled speed (testing/research)
//
// Stream lines are tagged by "kind":
//   {"kind":"request","userId":"u1","deviceId":"d1","ipAddress":"203.0.113.7","userAgent":"..."}
//   {"kind":"generate","userId":"u1","timeframe":"1H"}
//   {"kind":"tier_change","userId":"u1","subscriptionTier":"pro"}
//
// Usage:
//   trustgate --mode tail --path /var/log/app/trust.jsonl --accounts accounts.json
//   trustgate --mode replay --path captured.jsonl --speed 10.0 --config trustgate.json

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use trustgate::config::Config;
use trustgate::engine::SharingGuard;
use trustgate::events::{EnforcementAction, RequestContext, SharingDetectionResult, UserTrustState, UserUpdate};
use trustgate::notify::OutboxNotifier;
use trustgate::quota::{GenerationGate, QueuedGenerator};
use trustgate::state::{AccountStore, InMemoryStore, JsonlAuditLog};
use trustgate::throttle::{self, RequestThrottle, ThrottleDecision};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "trustgate",
    about   = "Account-sharing detection and atomic generation quotas",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "tail")]
    mode: Mode,

    #[arg(long, default_value = "/tmp/trustgate_feed.jsonl",
          help = "JSONL event stream path")]
    path: PathBuf,

    #[arg(long, default_value = "/tmp/trustgate_accounts.json",
          help = "JSON array of account rows to preload")]
    accounts: PathBuf,

    #[arg(long, default_value = "/tmp/trustgate_output",
          help = "Audit / outbox / generation queue directory")]
    output: PathBuf,

    #[arg(long, help = "JSON config file (defaults if omitted)")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Tail,    // follow a live JSONL stream
    Replay,  // replay a static JSONL file at scaled speed
}

// ── Stream events ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StreamEvent {
    Request(RequestEvent),
    Generate(GenerateEvent),
    TierChange(TierChangeEvent),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestEvent {
    #[serde(flatten)]
    request: RequestContext,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateEvent {
    user_id: String,
    timeframe: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TierChangeEvent {
    user_id: String,
    #[serde(flatten)]
    update: UserUpdate,
}

impl StreamEvent {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Request(e) => e.timestamp,
            Self::Generate(e) => e.timestamp,
            Self::TierChange(_) => None,
        }
    }

    /// Replay re-stamps events with wall-clock time so windows stay meaningful.
    fn restamp(&mut self, at: DateTime<Utc>) {
        match self {
            Self::Request(e) => e.timestamp = Some(at),
            Self::Generate(e) => e.timestamp = Some(at),
            Self::TierChange(_) => {}
        }
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Stats {
    requests:  AtomicU64,
    blocked:   AtomicU64,
    throttled: AtomicU64,
    generated: AtomicU64,
    rejected:  AtomicU64,
}

struct Pipeline {
    store:     Arc<InMemoryStore>,
    guard:     SharingGuard,
    gate:      GenerationGate,
    generator: QueuedGenerator,
    throttle:  Arc<RequestThrottle>,
    stats:     Stats,
}

impl Pipeline {
    fn new(config: &Config, output: &Path) -> Self {
        let store = Arc::new(InMemoryStore::new(config.detection.max_active_sessions));
        let guard = SharingGuard::new(
            store.clone(),
            store.clone(),
            Arc::new(JsonlAuditLog::new(output)),
            Arc::new(OutboxNotifier::new(output)),
            config.detection.clone(),
        );
        Self {
            gate:      GenerationGate::new(store.clone(), config.quota.clone()),
            generator: QueuedGenerator::new(output),
            throttle:  Arc::new(RequestThrottle::new(&config.throttle)),
            stats:     Stats::default(),
            store,
            guard,
        }
    }

    async fn process(&self, event: StreamEvent) {
        let now = event.timestamp().unwrap_or_else(Utc::now);
        match event {
            StreamEvent::Request(e) => self.on_request(e.request, now).await,
            StreamEvent::Generate(e) => self.on_generate(&e.user_id, &e.timeframe, now).await,
            StreamEvent::TierChange(e) => match self.store.update_user(&e.user_id, e.update).await {
                Ok(user) => info!(user_id = %user.id, tier = %user.subscription_tier, "account updated"),
                Err(e) => warn!(error = %e, "account update skipped"),
            },
        }
    }

    async fn on_request(&self, request: RequestContext, now: DateTime<Utc>) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        if let ThrottleDecision::Limited { retry_after_secs } = self.throttle.check_at(&request.user_id, now) {
            self.stats.throttled.fetch_add(1, Ordering::Relaxed);
            println!("\x1b[90m⏸  throttled {} retry_after={}s\x1b[0m", request.user_id, retry_after_secs);
            return;
        }

        let result = self.guard.detect_and_enforce_at(&request, now).await;
        if result.is_blocked() {
            self.stats.blocked.fetch_add(1, Ordering::Relaxed);
        }
        if result.is_blocked() || result.is_sharing {
            print_decision(&request, &result);
        }
    }

    async fn on_generate(&self, user_id: &str, timeframe: &str, now: DateTime<Utc>) {
        match self.gate.generate(user_id, timeframe, &self.generator, now).await {
            Ok(receipt) => {
                self.stats.generated.fetch_add(1, Ordering::Relaxed);
                println!(
                    "\x1b[92m✔  generate {} {} credits={} job={}\x1b[0m",
                    user_id,
                    timeframe,
                    receipt.ticket.previous_credits + 1,
                    receipt.signal.get("jobId").and_then(|j| j.as_str()).unwrap_or("-"),
                );
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                println!("\x1b[93m✖  generate {} → {} {}\x1b[0m", user_id, e.status(), e);
            }
        }
    }
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("  TRUSTGATE");
    println!("\x1b[0m");
    println!("  \x1b[90mAccount-sharing detection | atomic generation quotas\x1b[0m\n");
}

fn print_decision(request: &RequestContext, result: &SharingDetectionResult) {
    let action = result.enforcement.as_ref().map(|e| e.action).unwrap_or(EnforcementAction::Allow);
    let (color, icon) = match action {
        EnforcementAction::Terminate => ("\x1b[91;1m", "🔴"),
        EnforcementAction::Restrict  => ("\x1b[93;1m", "🟡"),
        EnforcementAction::Allow     => ("\x1b[96m",   "🔵"),
    };
    let reset = "\x1b[0m";

    println!("\n{}{} {}{}", color, icon, action, reset);
    println!("  User      : {}{}{}", color, request.user_id, reset);
    println!("  Device/IP : {} / {}", request.device_id.as_deref().unwrap_or("-"), request.ip_address);
    println!("  Confidence: {}{:.4}{}", color, result.confidence, reset);
    println!("  Reason    : {}", result.reason);
    if let Some(body) = result.rejection() {
        println!("  Rejection : {}", serde_json::to_string(&body).unwrap_or_default());
    }
}

async fn alert_prune_loop(pipeline: Arc<Pipeline>, interval_secs: u64) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    loop {
        tick.tick().await;
        let removed = pipeline.guard.prune_alerts(Utc::now());
        if removed > 0 {
            debug!(removed, "alert cooldown prune");
        }
    }
}

async fn print_stats_loop(pipeline: Arc<Pipeline>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let s = &pipeline.stats;
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  requests={}  blocked={}  throttled={}  generated={}  rejected={}  users={}  sessions={}/{} ──\x1b[0m",
            elapsed,
            s.requests.load(Ordering::Relaxed),
            s.blocked.load(Ordering::Relaxed),
            s.throttled.load(Ordering::Relaxed),
            s.generated.load(Ordering::Relaxed),
            s.rejected.load(Ordering::Relaxed),
            pipeline.store.n_users(),
            pipeline.store.n_active_sessions(),
            pipeline.store.n_sessions(),
        );
    }
}

// ── Event sources ─────────────────────────────────────────────────────────────

async fn load_accounts(path: &Path, store: &InMemoryStore) -> Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let users: Vec<UserTrustState> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(store.load_users(users))
}

fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("Parse error: {}", e);
            None
        }
    }
}

async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<StreamEvent>, seek_end: bool) -> Result<()> {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();

    if seek_end {
        while lines.next_line().await?.is_some() {} // consume existing
    }

    info!("Tailing {}", path.display());
    loop {
        match lines.next_line().await? {
            Some(line) => {
                if let Some(ev) = parse_line(&line) {
                    if tx.send(ev).await.is_err() {
                        break;
                    }
                }
            }
            None => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
        }
    }
    Ok(())
}

async fn replay_jsonl(path: PathBuf, tx: mpsc::Sender<StreamEvent>, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(&path).await?;
    // Untimed lines inherit the timestamp of the line before them.
    let mut last = 0i64;
    let mut events: Vec<(i64, StreamEvent)> = Vec::new();
    for ev in content.lines().filter_map(parse_line) {
        if let Some(t) = ev.timestamp() {
            last = t.timestamp_millis();
        }
        events.push((last, ev));
    }
    if events.is_empty() {
        return Ok(());
    }
    events.sort_by_key(|(ts, _)| *ts);

    let speed     = if speed > 0.0 { speed } else { 1.0 };
    let base_ts   = events.iter().map(|(ts, _)| *ts).find(|ts| *ts != 0).unwrap_or(0);
    let base_wall = Instant::now();

    for (ts, mut event) in events {
        let offset = (ts - base_ts).max(0) as f64 / speed / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset);
        let now = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        event.restamp(Utc::now());
        if tx.send(event).await.is_err() {
            break;
        }
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("trustgate=info".parse()?))
        .compact().init();

    let cli    = Cli::parse();
    let config = Config::load(cli.config.as_deref()).await?;
    tokio::fs::create_dir_all(&cli.output)
        .await
        .with_context(|| format!("creating {}", cli.output.display()))?;

    let pipeline = Arc::new(Pipeline::new(&config, &cli.output));
    match load_accounts(&cli.accounts, &pipeline.store).await {
        Ok(n) => info!(accounts = n, "accounts loaded"),
        Err(e) => warn!("No accounts preloaded: {:#}", e),
    }

    let start = Instant::now();
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(16384);

    print_banner();

    // Stats printer
    tokio::spawn(print_stats_loop(Arc::clone(&pipeline), start));

    // Throttle sweep
    tokio::spawn(throttle::sweep_loop(
        Arc::clone(&pipeline.throttle),
        config.throttle.sweep_interval_secs,
    ));

    // Alert cooldown housekeeping
    tokio::spawn(alert_prune_loop(
        Arc::clone(&pipeline),
        config.throttle.sweep_interval_secs,
    ));

    // Event source
    match cli.mode {
        Mode::Tail => {
            println!("  Mode: \x1b[96mTAIL\x1b[0m  |  {}", cli.path.display());
            println!("  Output: \x1b[90m{}\x1b[0m\n", cli.output.display());
            let path = cli.path.clone();
            tokio::spawn(async move {
                if let Err(e) = tail_jsonl(path, tx, true).await {
                    error!("Tail failed: {:#}", e);
                }
            });
        }

        Mode::Replay => {
            println!("  Mode: \x1b[93mREPLAY\x1b[0m  |  {}  speed={:.1}x", cli.path.display(), cli.speed);
            println!("  Output: \x1b[90m{}\x1b[0m\n", cli.output.display());
            let path  = cli.path.clone();
            let speed = cli.speed;
            tokio::spawn(async move {
                if let Err(e) = replay_jsonl(path, tx, speed).await {
                    error!("Replay failed: {:#}", e);
                }
            });
        }
    }

    println!("  Press Ctrl+C to stop.\n");

    // Events are processed in stream order: per-user ordering matters to the
    // session and quota state.
    while let Some(event) = rx.recv().await {
        pipeline.process(event).await;
    }

    Ok(())
}
