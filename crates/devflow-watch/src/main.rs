use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use devflow_core::TaskStatus;
use devflow_live::backoff::DEFAULT_MAX_ATTEMPTS;
use devflow_live::{
    BackoffPolicy, Cache, LiveClient, LiveConfig, SubscriptionFilter, TransportKind,
};
use std::collections::BTreeMap;
use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws";

#[derive(Parser, Debug)]
#[command(name = "devflow-watch", about = "Follow live task board events")]
struct Args {
    /// Live endpoint; ws(s):// for WebSocket, http(s):// for SSE.
    #[arg(long, default_value = "")]
    url: String,
    /// Force `websocket` or `sse` instead of inferring it from the url.
    #[arg(long, default_value = "")]
    transport: String,
    /// Comma-separated task ids; empty follows every task.
    #[arg(long, default_value = "")]
    tasks: String,
    /// Consecutive connection attempts before giving up; 0 never gives up.
    #[arg(long)]
    max_reconnects: Option<u32>,
    #[arg(long, default_value_t = 30)]
    summary_seconds: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[derive(Debug)]
struct Config {
    url: Url,
    transport: TransportKind,
    filter: SubscriptionFilter,
    max_attempts: Option<u32>,
    summary_interval: Duration,
    debug: bool,
    log_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(Args::parse())?;
    let _log_guard = init_logging(&config);

    let live = match config.transport {
        TransportKind::WebSocket => LiveConfig::websocket(config.url.clone()),
        TransportKind::Sse => LiveConfig::sse(config.url.clone()),
    }
    .with_filter(Some(config.filter.clone()))
    .with_backoff(BackoffPolicy {
        max_attempts: config.max_attempts,
        ..BackoffPolicy::default()
    });

    let mut client = LiveClient::spawn(live);
    let mut invalidations = client
        .take_invalidations()
        .context("invalidation stream already taken")?;
    let mut events = client.listen_all();
    let mut status = client.status();
    let cache = client.cache();
    let mut summary = tokio::time::interval(config.summary_interval);
    summary.tick().await;

    info!(
        event = "watch_start",
        url = %config.url,
        transport = %config.transport,
        filter = ?config.filter
    );
    client.connect()?;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                info!(
                    event = "watch_status",
                    state = %current.state,
                    attempt = current.attempt,
                    retry_pending = current.retry_pending
                );
                if current.is_exhausted() {
                    error!(event = "watch_gave_up", attempts = current.attempt);
                    break;
                }
            }
            Some(domain_event) = events.recv() => {
                info!(
                    event = "watch_event",
                    kind = %domain_event.kind_str(),
                    task_id = domain_event.task_id().unwrap_or("-"),
                    payload = %domain_event.to_value()
                );
            }
            Some(invalidation) = invalidations.recv() => {
                info!(
                    event = "watch_invalidation",
                    collection = %invalidation.key,
                    cause = %invalidation.cause
                );
            }
            _ = summary.tick() => {
                let line = cache.read(summarize);
                info!(event = "watch_summary", at = %Utc::now().to_rfc3339(), summary = %line);
            }
            _ = &mut interrupted => {
                info!(event = "watch_interrupted");
                break;
            }
        }
    }

    client.dispose().await;
    info!(event = "watch_stop");
    Ok(())
}

fn load_config(args: Args) -> Result<Config> {
    let url = resolve_url(&args.url);
    let url = Url::parse(&url).with_context(|| format!("invalid url `{url}`"))?;
    let transport = resolve_transport(&args.transport, &url)?;
    Ok(Config {
        url,
        transport,
        filter: resolve_filter(&args.tasks),
        max_attempts: resolve_max_attempts(args.max_reconnects),
        summary_interval: Duration::from_secs(args.summary_seconds.max(1)),
        debug: args.debug,
        log_dir: resolve_log_dir(&args.log_dir),
    })
}

fn resolve_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var("DEVFLOW_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_URL.to_string()
}

fn resolve_transport(flag: &str, url: &Url) -> Result<TransportKind> {
    let mut requested = flag.trim().to_string();
    if requested.is_empty() {
        requested = env::var("DEVFLOW_TRANSPORT").unwrap_or_default();
    }
    if !requested.trim().is_empty() {
        return requested.parse::<TransportKind>().map_err(anyhow::Error::msg);
    }
    match TransportKind::from_url(url) {
        Some(kind) => Ok(kind),
        None => bail!("cannot infer transport from `{}`; pass --transport", url.scheme()),
    }
}

fn resolve_filter(flag: &str) -> SubscriptionFilter {
    let mut tasks = flag.to_string();
    if tasks.trim().is_empty() {
        tasks = env::var("DEVFLOW_TASKS").unwrap_or_default();
    }
    parse_task_filter(&tasks)
}

fn parse_task_filter(value: &str) -> SubscriptionFilter {
    SubscriptionFilter::tasks(value.split(',').map(str::trim).filter(|id| !id.is_empty()))
        .unwrap_or_default()
}

fn resolve_max_attempts(flag: Option<u32>) -> Option<u32> {
    let value = flag.or_else(|| {
        env::var("DEVFLOW_MAX_RECONNECTS")
            .ok()
            .and_then(|value| value.trim().parse::<u32>().ok())
    });
    match value {
        Some(0) => None,
        Some(max) => Some(max),
        None => Some(DEFAULT_MAX_ATTEMPTS),
    }
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env::var("DEVFLOW_LOG_DIR").unwrap_or_default()
}

fn summarize(cache: &Cache) -> String {
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for task in cache.tasks() {
        *by_status.entry(task.status.as_str()).or_default() += 1;
    }
    let statuses = by_status
        .iter()
        .map(|(status, count)| format!("{status}={count}"))
        .collect::<Vec<_>>()
        .join(",");
    let open = cache
        .tasks()
        .filter(|task| !task.status.is_terminal() && task.status != TaskStatus::Backlog)
        .count();
    format!(
        "rev={} tasks={} open={} executing={} stale={} [{}]",
        cache.revision(),
        cache.tasks().count(),
        open,
        cache.executing_tasks().count(),
        cache.stale().count(),
        statuses
    )
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = env::var("DEVFLOW_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&config.log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    // Without a log file stdout is the only sink, so it stays on.
    let stdout = guard.file.is_none() || parse_bool_env("DEVFLOW_LOG_STDOUT").unwrap_or(true);
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(stdout, file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: Option<io::Stdout>,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(stdout: bool, file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: stdout.then(io::stdout),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(stdout) = &mut self.stdout {
            let _ = stdout.write_all(buf);
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(stdout) = &mut self.stdout {
            let _ = stdout.flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("devflow-watch-{}.log", std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn parse_bool_env(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
