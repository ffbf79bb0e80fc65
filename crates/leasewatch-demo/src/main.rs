//! Runs a simulated workload against an in-memory pool with the lease monitor
//! attached: well-behaved workers, one slow holder, and one thread that exits
//! while still holding a connection.
//!
//! At the end the outstanding leases are printed to stdout as JSON.

mod pool;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use leasewatch::{MonitorConfig, OwnerScope, TrackedProvider};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pool::MemoryPool;

type Provider = TrackedProvider<MemoryPool>;

#[derive(Debug)]
struct Options {
    interval: Duration,
    threshold: Duration,
    workers: u32,
    run_for: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            threshold: Duration::from_secs(2),
            workers: 4,
            run_for: Duration::from_secs(5),
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: leasewatch-demo [options]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --interval <secs>   Sweep interval [default: 1]");
            eprintln!("  --threshold <secs>  Lease threshold [default: 2]");
            eprintln!("  --workers <n>       Well-behaved workers [default: 4]");
            eprintln!("  --run-for <secs>    Total run time [default: 5]");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--interval" | "--threshold" | "--run-for" => {
                i += 1;
                let value = args.get(i).ok_or(format!("{flag} requires a value"))?;
                let secs = parse_seconds(value).ok_or(format!("{flag}: invalid seconds '{value}'"))?;
                match flag {
                    "--interval" => options.interval = secs,
                    "--threshold" => options.threshold = secs,
                    _ => options.run_for = secs,
                }
            }
            "--workers" => {
                i += 1;
                let value = args.get(i).ok_or("--workers requires a value")?;
                options.workers = value
                    .parse()
                    .map_err(|_| format!("--workers: invalid count '{value}'"))?;
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.parse().ok()?;
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// RUST_LOG wins; otherwise LEASEWATCH_LOG picks the level for this binary and
/// the library. LOG_FORMAT=json switches to JSON lines on stderr.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("LEASEWATCH_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "leasewatch={level},leasewatch_demo={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(options: Options) -> anyhow::Result<()> {
    tracing::info!(?options, "Starting demo workload");

    let pool_size = options.workers + 2;
    let config = MonitorConfig::default()
        .with_sweep_interval(options.interval)
        .with_lease_threshold(options.threshold)
        .with_app_prefix("leasewatch_demo");
    let provider = Arc::new(
        TrackedProvider::builder(MemoryPool::new(pool_size, Duration::from_secs(1)))
            .config(config)
            .build(),
    );
    provider.start().context("failed to start lease monitor")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for n in 0..options.workers {
        let provider = Arc::clone(&provider);
        let shutdown = shutdown_rx.clone();
        let scope = OwnerScope::new(format!("worker-{n}"));
        tasks.push(tokio::spawn(scope.run(worker(provider, n, shutdown))));
    }

    let slow = Arc::clone(&provider);
    let hold_for = options.threshold * 2;
    tasks.push(tokio::spawn(
        OwnerScope::new("report-builder").run(async move { slow_holder(slow, hold_for).await }),
    ));

    leak_from_thread(Arc::clone(&provider)).await?;

    tokio::time::sleep(options.run_for).await;
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Workload task failed");
        }
    }

    provider.stop().await;
    provider.pool().close();

    let leases = provider.leases();
    tracing::info!(
        outstanding = leases.len(),
        idle = provider.pool().idle(),
        "Demo finished"
    );
    println!("{}", serde_json::to_string_pretty(&leases)?);
    Ok(())
}

/// Acquire, hold briefly, release. Repeat until shutdown.
async fn worker(provider: Arc<Provider>, n: u32, mut shutdown: watch::Receiver<bool>) {
    let hold = Duration::from_millis(20 + 15 * u64::from(n % 5));
    loop {
        if *shutdown.borrow() {
            return;
        }
        match provider.acquire().await {
            Ok(conn) => {
                tokio::time::sleep(hold).await;
                if let Err(e) = provider.release(conn).await {
                    tracing::warn!(worker = n, error = %e, "Release failed");
                }
            }
            Err(e) => tracing::warn!(worker = n, error = %e, "Acquire failed"),
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(hold) => {}
        }
    }
}

/// Holds one connection past the threshold, then gives it back.
async fn slow_holder(provider: Arc<Provider>, hold_for: Duration) {
    let conn = match provider.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(error = %e, "Slow holder could not acquire");
            return;
        }
    };
    tracing::info!(connection = conn.id, ?hold_for, "Holding connection");
    tokio::time::sleep(hold_for).await;
    if let Err(e) = provider.release(conn).await {
        tracing::warn!(error = %e, "Slow holder release failed");
    }
}

/// A plain OS thread that checks out a connection and exits without
/// returning it. The monitor reclaims it on the next sweep.
async fn leak_from_thread(provider: Arc<Provider>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Handle::current();
    let thread = std::thread::Builder::new()
        .name("nightly-import".to_string())
        .spawn(move || runtime.block_on(provider.acquire()))
        .context("failed to spawn leaking thread")?;

    let conn = tokio::task::spawn_blocking(move || thread.join())
        .await?
        .map_err(|_| anyhow::anyhow!("leaking thread panicked"))??;
    tracing::info!(connection = conn.id, "nightly-import exited holding a connection");
    Ok(())
}
