//! Work distribution across devices.
//!
//! Batch sizes are split into contiguous slices, one per device; every
//! device tunes every weight shape for its slice. Each worker thread binds
//! its own device context and keeps it for its whole lifetime, so no device
//! state is shared between workers. The only shared resource is the result
//! store, which serializes its own writers.
//!
//! A failing worker does not stop its siblings: all workers are joined and
//! failures are reported together afterwards.

use std::any::Any;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::autotuning::cache::{ResultStore, TableKey};
use crate::autotuning::measure::BenchConfig;
use crate::autotuning::search::{tune_shape, TuneSession, TunedEntry};
use crate::autotuning::search_space::SearchSpace;
use crate::device::{ComputeDevice, DeviceRuntime};
use crate::error::{TuneError, TuneResult};
use crate::traits::BlockMatmul;
use crate::types::{BlockSize, InputFormat, OutputDtype, WeightShape};

/// Work assigned to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningJob {
    pub device: usize,
    pub batch_sizes: Vec<usize>,
    pub weight_shapes: Vec<WeightShape>,
}

/// Run-wide tuning parameters handed to every worker.
#[derive(Debug, Clone)]
pub struct TuneRequest {
    pub input_type: InputFormat,
    pub out_dtype: OutputDtype,
    pub block: BlockSize,
    pub bench: BenchConfig,
}

/// What one worker accomplished.
#[derive(Debug, Clone)]
pub struct DeviceReport {
    pub device: usize,
    pub device_name: String,
    pub entries: Vec<TunedEntry>,
    /// Table files written, in shape order
    pub tables: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Per-device reports, ordered by device
    pub reports: Vec<DeviceReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn tables_written(&self) -> usize {
        self.reports.iter().map(|r| r.tables.len()).sum()
    }
}

/// Split `batch_sizes` into `n` contiguous slices; slice `i` covers
/// indices `[i * len / n, (i + 1) * len / n)`. Some slices may be empty.
pub fn partition_batch_sizes(batch_sizes: &[usize], n: usize) -> Vec<Vec<usize>> {
    let len = batch_sizes.len();
    (0..n)
        .map(|i| batch_sizes[i * len / n..(i + 1) * len / n].to_vec())
        .collect()
}

/// Assign work to devices.
///
/// A single batch size is tuned on device 0 alone. Devices whose slice
/// comes out empty get no job.
pub fn plan_jobs(batch_sizes: &[usize], weight_shapes: &[WeightShape], device_count: usize) -> TuneResult<Vec<TuningJob>> {
    if device_count == 0 {
        return Err(TuneError::NoDevices);
    }
    if batch_sizes.is_empty() {
        return Err(TuneError::InvalidConfig("no batch sizes to tune".into()));
    }
    let workers = if batch_sizes.len() == 1 { 1 } else { device_count };

    let jobs: Vec<TuningJob> = partition_batch_sizes(batch_sizes, workers)
        .into_iter()
        .enumerate()
        .filter(|(device, slice)| {
            if slice.is_empty() {
                log::debug!("device {device} gets no batch sizes; skipping");
            }
            !slice.is_empty()
        })
        .map(|(device, slice)| TuningJob {
            device,
            batch_sizes: slice,
            weight_shapes: weight_shapes.to_vec(),
        })
        .collect();
    Ok(jobs)
}

/// Worker body: bind the device, tune every shape, save after each shape.
pub fn tune_on_device<R, K>(
    runtime: &R,
    kernel: &K,
    job: &TuningJob,
    request: &TuneRequest,
    store: &ResultStore,
) -> TuneResult<DeviceReport>
where
    R: DeviceRuntime,
    K: BlockMatmul<R::Device>,
{
    let t0 = Instant::now();
    let device = runtime.bind(job.device)?;
    let family = device.family();
    let ordinal = device.ordinal();

    let space = SearchSpace::for_family(family);
    let candidates = space.candidates_for_block_k(request.block.block_k);
    log::info!(
        "[device {ordinal}] {} ({}): batch sizes {:?}, {} shapes, {}/{} candidates divide block_k={}",
        device.name(),
        family.name(),
        job.batch_sizes,
        job.weight_shapes.len(),
        candidates.len(),
        space.grid_size(),
        request.block.block_k,
    );

    let session = TuneSession {
        candidates: &candidates,
        block: request.block,
        format: request.input_type.resolve(family),
        out_dtype: request.out_dtype,
        bench: &request.bench,
    };

    let total = job.weight_shapes.len();
    let mut entries = Vec::new();
    let mut tables = Vec::with_capacity(total);
    for (i, &shape) in job.weight_shapes.iter().enumerate() {
        log::info!("[device {ordinal}] shape {}/{total}: {shape}", i + 1);
        let (table, shape_entries) = tune_shape(&device, kernel, &session, shape, &job.batch_sizes)?;
        let key = TableKey::new(shape, device.name(), request.input_type, request.block);
        tables.push(store.merge_and_save(&key, &table)?);
        entries.extend(shape_entries);
    }

    let elapsed = t0.elapsed();
    log::info!("[device {ordinal}] tuning took {:.2}s", elapsed.as_secs_f64());
    Ok(DeviceReport {
        device: ordinal,
        device_name: device.name().to_string(),
        entries,
        tables,
        elapsed,
    })
}

/// Run every job on its own thread and wait for all of them.
pub fn run_jobs<R, K>(
    runtime: &R,
    kernel: &K,
    jobs: &[TuningJob],
    request: &TuneRequest,
    store: &ResultStore,
) -> TuneResult<RunSummary>
where
    R: DeviceRuntime,
    K: BlockMatmul<R::Device>,
{
    let t0 = Instant::now();
    log::info!("starting {} tuning worker(s)", jobs.len());

    let (mut reports, failures) = std::thread::scope(|scope| {
        let mut pending = Vec::with_capacity(jobs.len());
        let mut failures = Vec::new();
        for job in jobs {
            let spawned = std::thread::Builder::new()
                .name(format!("tune-device-{}", job.device))
                .spawn_scoped(scope, move || tune_on_device(runtime, kernel, job, request, store));
            match spawned {
                Ok(handle) => pending.push((job.device, handle)),
                Err(e) => failures.push(format!("device {}: failed to spawn worker: {e}", job.device)),
            }
        }

        let mut reports = Vec::with_capacity(pending.len());
        for (device, handle) in pending {
            match handle.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    log::error!("[device {device}] worker failed: {e}");
                    failures.push(format!("device {device}: {e}"));
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    log::error!("[device {device}] worker panicked: {msg}");
                    failures.push(format!("device {device}: worker panicked: {msg}"));
                }
            }
        }
        (reports, failures)
    });

    if !failures.is_empty() {
        return Err(TuneError::WorkerFailed { failures });
    }

    reports.sort_by_key(|r| r.device);
    let summary = RunSummary {
        reports,
        elapsed: t0.elapsed(),
    };
    for r in &summary.reports {
        log::info!(
            "device {} ({}): {} entries, {} tables, {:.2}s",
            r.device,
            r.device_name,
            r.entries.len(),
            r.tables.len(),
            r.elapsed.as_secs_f64()
        );
    }
    log::info!(
        "tuning completed: {} table(s) written in {:.2}s",
        summary.tables_written(),
        summary.elapsed.as_secs_f64()
    );
    Ok(summary)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
