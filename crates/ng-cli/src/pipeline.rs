//! `run` and `bench`: feed signals through a router on blocking worker
//! threads while the async side handles input and ctrl-c.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use ng_core::{Config, Error, IngestQueue, Signal, SignalRouter, StatsSnapshot, WorkerReport};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

#[derive(Serialize)]
struct RunSummary {
    processed: u64,
    failed: u64,
    malformed_lines: u64,
    tokens: usize,
    stats: StatsSnapshot,
}

#[derive(Serialize)]
struct BenchSummary {
    events: usize,
    distinct: usize,
    workers: usize,
    elapsed_ms: f64,
    events_per_sec: f64,
    tokens: usize,
    stats: StatsSnapshot,
}

fn parse_subscription(spec: &str) -> Result<(&str, Value)> {
    let (name, filter) = spec
        .split_once('=')
        .with_context(|| format!("subscription '{spec}' is not NAME=FILTER_JSON"))?;
    if name.trim().is_empty() {
        bail!("subscription '{spec}' has an empty name");
    }
    let filter: Value = serde_json::from_str(filter)
        .with_context(|| format!("subscription '{name}' filter is not valid JSON"))?;
    Ok((name.trim(), filter))
}

fn register_printers(router: &SignalRouter, specs: &[String]) -> Result<()> {
    for spec in specs {
        let (name, filter) = parse_subscription(spec)?;
        let label = name.to_string();
        router
            .subscribe(name, &filter, move |e| {
                let line = json!({
                    "subscription": label.as_str(),
                    "event_type": e.event_type,
                    "priority": e.priority,
                    "token_id": e.token_id,
                    "is_novel": e.is_novel,
                    "fast_path": e.fast_path,
                });
                println!("{line}");
                Ok(())
            })
            .with_context(|| format!("subscription '{name}' rejected"))?;
    }
    Ok(())
}

async fn open_input(file: Option<&Path>) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    Ok(match file {
        Some(path) => {
            let f = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Box::new(BufReader::new(f))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    })
}

pub async fn cmd_run(config: Config, file: Option<&Path>, workers: usize, subscriptions: &[String]) -> Result<()> {
    let queue = Arc::new(IngestQueue::new(config.channel_size, config.queue_policy));
    let router = Arc::new(SignalRouter::new(config).context("failed to start router")?);
    register_printers(&router, subscriptions)?;
    let input = open_input(file).await?;
    let _analysis = router.spawn_analysis();

    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let (router, queue) = (Arc::clone(&router), Arc::clone(&queue));
            tokio::task::spawn_blocking(move || router.run_worker(&queue))
        })
        .collect();

    // workers only exit once the queue is closed, whatever the feed did
    let fed = feed(&router, &queue, input).await;
    queue.close();
    let mut total = WorkerReport::default();
    for handle in handles {
        let report = handle.await.context("routing worker panicked")?;
        total.processed += report.processed;
        total.failed += report.failed;
    }
    let malformed = fed?;

    let summary = RunSummary {
        processed: total.processed,
        failed: total.failed,
        malformed_lines: malformed,
        tokens: router.index().len(),
        stats: router.get_stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Queue every well-formed line until input ends or ctrl-c. Returns the
/// number of malformed lines skipped.
async fn feed(
    router: &SignalRouter,
    queue: &IngestQueue,
    input: Box<dyn AsyncBufRead + Unpin + Send>,
) -> Result<u64> {
    let mut lines = input.lines();
    let mut malformed = 0u64;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupted, draining queue");
                break;
            }
            line = lines.next_line() => line.context("failed to read input")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let signal: Signal = match serde_json::from_str(line) {
            Ok(signal) => signal,
            Err(e) => {
                malformed += 1;
                tracing::warn!("skipping malformed line: {e}");
                continue;
            }
        };

        // a blocking queue parks this thread until a worker makes room
        match tokio::task::block_in_place(|| router.submit(queue, signal)) {
            Ok(()) | Err(Error::QueueFull(_)) => {}
            Err(Error::QueueClosed) => break,
            Err(e) => return Err(e).context("failed to queue signal"),
        }
    }
    Ok(malformed)
}

pub async fn cmd_bench(config: Config, events: usize, distinct: usize, workers: usize) -> Result<()> {
    if distinct == 0 {
        bail!("--distinct must be at least 1");
    }
    let workers = workers.max(1);
    let dim = config.vector_dim;
    let router = Arc::new(SignalRouter::new(config).context("failed to start router")?);

    let mut rng = SmallRng::seed_from_u64(42);
    let vectors: Arc<Vec<Vec<f32>>> = Arc::new(
        (0..distinct)
            .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0f32)).collect())
            .collect(),
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let (router, vectors) = (Arc::clone(&router), Arc::clone(&vectors));
            let share = events / workers + usize::from(w < events % workers);
            tokio::task::spawn_blocking(move || -> ng_core::Result<()> {
                let mut rng = SmallRng::seed_from_u64(w as u64);
                for _ in 0..share {
                    let v = &vectors[rng.random_range(0..vectors.len())];
                    router.emit("bench.signal", v, 128)?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle
            .await
            .context("bench worker panicked")?
            .context("bench emit failed")?;
    }
    let elapsed = started.elapsed();

    let summary = BenchSummary {
        events,
        distinct,
        workers,
        elapsed_ms: elapsed.as_secs_f64() * 1e3,
        events_per_sec: events as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        tokens: router.index().len(),
        stats: router.get_stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
