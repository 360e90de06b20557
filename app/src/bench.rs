use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{
    config::TestSettings,
    exec::{CommandExecutor, Executor},
};
use eyre::{Context, Result};
use fio::{FioResult, WorkQueue};
use tokio::fs::{read_to_string, write};
use tracing::{debug, info, warn};

/// Hard upper bound on concurrent fio units, whatever the config asks for.
pub const WORKERS_LIMIT: i32 = 32;

pub async fn run_benchmark(
    config_file: &str,
    output_file: Option<String>,
    dryrun: bool,
) -> Result<()> {
    let executor: Arc<dyn Executor> = Arc::new(CommandExecutor);
    let version = fio::version(executor.as_ref()).await?;
    info!("using {version}");

    let settings = parse_settings(config_file).await?;
    let queue = WorkQueue::build(&settings, executor.as_ref()).await?;
    if queue.is_empty() {
        warn!("generated work queue is empty, nothing to do");
        return Ok(());
    }

    let delay = Duration::from_secs(settings.delay_secs);
    let results = dispatch(executor, settings.workers, delay, queue, dryrun).await?;
    match output_file {
        Some(path) => {
            write(&path, serde_json::to_string_pretty(&results)?)
                .await
                .with_context(|| format!("failed to write results to {path}"))?;
            info!("wrote {} results to {path}", results.len());
        }
        None => {
            for result in &results {
                for job in &result.jobs {
                    println!(
                        "{}: read iops {:.2} bw {:.2} KiB/s lat {:.3} ms, write iops {:.2} bw {:.2} KiB/s lat {:.3} ms",
                        job.jobname,
                        job.read.iops_mean,
                        job.read.bw_mean,
                        job.read.lat_ns.mean / 1_000_000.0,
                        job.write.iops_mean,
                        job.write.bw_mean,
                        job.write.lat_ns.mean / 1_000_000.0,
                    );
                }
            }
        }
    }
    Ok(())
}

pub async fn parse_settings(config_file: &str) -> Result<TestSettings> {
    let raw = read_to_string(config_file)
        .await
        .with_context(|| format!("failed to read config file {config_file}"))?;
    let mut settings: TestSettings = serde_yml::from_str(&raw)?;
    settings.validate()?;
    Ok(settings)
}

fn concurrency_ceiling(workers: i32, targets: usize) -> usize {
    (workers.min(WORKERS_LIMIT).max(1) as usize).min(targets.max(1))
}

/// Run every unit of the queue, at most `ceiling` in flight. One spawned task
/// per unit; a unit runs its items strictly in order, merges its results into
/// the shared collection and hands its slot token back.
async fn dispatch(
    executor: Arc<dyn Executor>,
    workers: i32,
    delay: Duration,
    queue: WorkQueue,
    dryrun: bool,
) -> Result<Vec<FioResult>> {
    let ceiling = concurrency_ceiling(workers, queue.len());
    info!(
        "dispatching {} units with at most {ceiling} in flight",
        queue.len()
    );

    let (intake_tx, intake_rx) = flume::unbounded();
    for unit in queue.queue {
        intake_tx.send(unit)?;
    }
    drop(intake_tx);

    let (slot_tx, slot_rx) = flume::bounded(ceiling);
    for _ in 0..ceiling {
        slot_tx.send(())?;
    }

    let results: Arc<Mutex<Vec<FioResult>>> = Arc::default();
    let mut handles = Vec::new();
    while let Ok((target, items)) = intake_rx.recv_async().await {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        slot_rx.recv_async().await?;
        let executor = executor.clone();
        let results = results.clone();
        let slot_tx = slot_tx.clone();
        handles.push(tokio::spawn(async move {
            debug!("running {} items against {target}", items.len());
            let unit_results = fio::run_unit(executor.as_ref(), &items, dryrun).await;
            results.lock().unwrap().extend(unit_results);
            let _ = slot_tx.send(());
        }));
    }
    for handle in handles {
        handle.await?;
    }

    let results = std::mem::take(&mut *results.lock().unwrap());
    Ok(results)
}
