//! Offline autotuning of block-scaled W8A8 matmul launch configs.
//!
//! For every (weight shape, batch size) pair the tuner measures each
//! admissible launch config on a real device and persists the fastest one
//! into a per-shape table that inference looks up later.
//!
//! # Architecture
//!
//! ```text
//! search_space   -- per-family candidate grid + block_k divisibility filter
//! workload       -- random quantized operands and block scales
//! measure        -- warmup + timed launches, rejection-tolerant
//! search         -- best-of-all per batch size, per shape
//! cache          -- merged, sorted, atomically written JSON tables
//! lock           -- in-process mutex + cross-process flock around the store
//! distribute     -- batch-size slices, one worker thread per device
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use gllm_block_tuner::autotuning::{self, ResultStore};
//! use gllm_block_tuner::cpu_backend::CpuRuntime;
//! use gllm_block_tuner::cpu_kernels::HostBlockMatmul;
//! use gllm_block_tuner::config::TunerConfig;
//! use gllm_block_tuner::types::HardwareFamily;
//!
//! let config = TunerConfig { batch_size: Some(16), ..TunerConfig::default() };
//! let runtime = CpuRuntime::partitioned(2, HardwareFamily::Cuda);
//! let store = ResultStore::new(&config.save_path);
//! let summary = autotuning::run(&runtime, &HostBlockMatmul::new(), &config, &store)?;
//! println!("{} tables written", summary.tables_written());
//! # Ok::<(), gllm_block_tuner::error::TuneError>(())
//! ```

pub mod cache;
pub mod distribute;
pub mod lock;
pub mod measure;
pub mod search;
pub mod search_space;
pub mod workload;

pub use cache::{ResultStore, TableKey, TuningTable};
pub use distribute::{
    partition_batch_sizes, plan_jobs, run_jobs, tune_on_device, DeviceReport, RunSummary, TuneRequest, TuningJob,
};
pub use measure::{measure, BenchConfig, BenchOutcome, BenchResult};
pub use search::{format_report, tune_batch_size, tune_shape, TuneSession, TunedEntry};
pub use search_space::{filter_divides_block_k, KernelConfig, SearchSpace};
pub use workload::Workload;

use crate::config::TunerConfig;
use crate::device::DeviceRuntime;
use crate::error::TuneResult;
use crate::traits::BlockMatmul;

/// Validate `config`, plan jobs over every device of `runtime`, and run them.
pub fn run<R, K>(runtime: &R, kernel: &K, config: &TunerConfig, store: &ResultStore) -> TuneResult<RunSummary>
where
    R: DeviceRuntime,
    K: BlockMatmul<R::Device>,
{
    config.validate()?;
    let device_count = runtime.device_count()?;
    log::info!("found {device_count} device(s) for parallel tuning");

    let batch_sizes = config.batch_sizes();
    let shapes = config.weight_shapes();
    let jobs = plan_jobs(&batch_sizes, &shapes, device_count)?;
    run_jobs(runtime, kernel, &jobs, &config.tune_request(), store)
}
