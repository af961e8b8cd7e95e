//! gllm-block-tuner: offline autotuner for block-wise quantized matmul kernels.
//!
//! This crate searches kernel launch configurations for fp8/int8 W8A8
//! matmuls with per-block scales and persists the fastest config per
//! (weight shape, batch size) for inference-time lookup:
//! - **Per-family search spaces**: deep-pipeline (CUDA) and wide-CU (ROCm) grids
//! - **Rejection-tolerant timing**: configs the runtime refuses are skipped
//! - **Multi-device**: batch sizes split across devices, one worker each
//! - **Merge-safe store**: tables are enriched, never clobbered, even by
//!   concurrent processes
//!
//! # Quick Start
//!
//! ```ignore
//! use gllm_block_tuner::{autotuning, CpuRuntime, HostBlockMatmul, ResultStore, TunerConfig};
//!
//! let config = TunerConfig::default();
//! let runtime = CpuRuntime::partitioned(4, config.host.family);
//! let store = ResultStore::new(&config.save_path);
//! autotuning::run(&runtime, &HostBlockMatmul::new(), &config, &store)?;
//! ```

pub mod autotuning;
pub mod config;
pub mod cpu_backend;
pub mod cpu_kernels;
#[cfg(feature = "cuda")]
pub mod cuda_backend;
pub mod device;
pub mod error;
pub mod quant;
pub mod traits;
pub mod types;
pub mod weights;

pub use autotuning::{KernelConfig, ResultStore, RunSummary, SearchSpace, TableKey, TuningJob, TuningTable};
pub use config::TunerConfig;
pub use cpu_backend::{CpuDevice, CpuRuntime, DeviceLimits};
pub use cpu_kernels::HostBlockMatmul;
#[cfg(feature = "cuda")]
pub use cuda_backend::{CudaDevice, CudaRuntime};
pub use device::{ComputeDevice, DeviceRuntime};
pub use error::{KernelError, TuneError, TuneResult};
pub use traits::BlockMatmul;
pub use types::{BlockSize, HardwareFamily, InputFormat, OutputDtype, QuantFormat, WeightShape};
