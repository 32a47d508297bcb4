//! pool_bench — a small command-line driver for `pool-core`.
//!
//! Submits a batch of payloads through a [`pool_core::Pool`] configured from
//! CLI flags and reports how long the batch took plus how many tasks failed
//! or were retried. Useful for sanity-checking a `PoolOptions` choice (how
//! much the grow-first policy helps, whether a given `task_loop_time` keeps
//! up with a slow body) without writing a throwaway test.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use pool_core::{body, Pool, PoolOptions, TaskOptions};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "pool_bench", about = "Benchmark a pool-core dispatcher")]
struct Args {
    /// Number of payloads to submit.
    #[arg(long, default_value = "20")]
    tasks: usize,

    /// Pool's maxThreads.
    #[arg(long, default_value = "4")]
    max_threads: usize,

    /// Pool's maxTasks (queue bound).
    #[arg(long, default_value = "100")]
    max_tasks: usize,

    /// Pool's taskRetry default.
    #[arg(long, default_value = "0")]
    task_retry: u32,

    /// Pool's taskLoopTime in milliseconds.
    #[arg(long, default_value = "1000")]
    task_loop_time_ms: u64,

    /// Simulated work duration per task invocation, in milliseconds.
    #[arg(long, default_value = "50")]
    work_ms: u64,

    /// Fail this fraction (0-100) of invocations, to exercise retries.
    #[arg(long, default_value = "0")]
    fail_percent: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let invocations = Arc::new(AtomicU32::new(0));
    let work_ms = args.work_ms;
    let fail_percent = args.fail_percent as u32;
    let counter = invocations.clone();

    let default_body = body::closure(move |payload| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(work_ms)).await;
            if fail_percent > 0 && n % 100 < fail_percent {
                anyhow::bail!("simulated failure on invocation {n}");
            }
            Ok(payload)
        }
    });

    let pool = Pool::new(
        default_body,
        PoolOptions {
            max_threads: args.max_threads,
            max_tasks: args.max_tasks,
            task_retry: args.task_retry,
            task_loop_time: Duration::from_millis(args.task_loop_time_ms),
            ..Default::default()
        },
    )?;

    let start = Instant::now();
    let mut handles = Vec::with_capacity(args.tasks);
    let mut rejected = 0usize;
    for i in 0..args.tasks {
        match pool.send(Value::from(i), TaskOptions::default()).await {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                rejected += 1;
                tracing::warn!(task = i, %err, "send rejected");
            }
        }
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(_) => succeeded += 1,
            Err(err) => {
                failed += 1;
                tracing::warn!(%err, "task did not complete");
            }
        }
    }

    let elapsed = start.elapsed();
    println!("submitted:  {}", args.tasks);
    println!("rejected:   {rejected}");
    println!("succeeded:  {succeeded}");
    println!("failed:     {failed}");
    println!("invocations: {}", invocations.load(Ordering::SeqCst));
    println!("elapsed:    {elapsed:.2?}");
    println!("threads:    {}", pool.thread_length().await?);

    pool.shutdown().await;
    Ok(())
}
