//! gllm-block-tune: tune block-wise W8A8 matmul launch configs.
//!
//! Runs against the host runtime: CPU cores are split into logical devices
//! and the reference kernel is timed on each. Tables land in `--save-path`
//! and are merged with whatever is already there.
//!
//! Examples:
//!   gllm-block-tune --tp-size 8 --input-type fp8
//!   gllm-block-tune --batch-size 64 --devices 1 --family rocm
//!   GLLM_TUNE_ITERS=3 gllm-block-tune --config tune.json

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use gllm_block_tuner::autotuning::{self, format_report, ResultStore};
use gllm_block_tuner::config::TunerConfig;
use gllm_block_tuner::cpu_backend::CpuRuntime;
use gllm_block_tuner::cpu_kernels::HostBlockMatmul;
use gllm_block_tuner::error::TuneResult;
use gllm_block_tuner::types::{HardwareFamily, InputFormat, OutputDtype};

/// Block-wise W8A8 matmul autotuner
///
/// Every flag overrides the config file and GLLM_TUNE_* environment variables.
#[derive(Parser, Debug)]
#[command(name = "gllm-block-tune")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Tensor-parallel degree used to split the weight shapes
    #[arg(long = "tp-size", visible_alias = "tp")]
    tp_size: Option<usize>,

    /// Quantized operand type
    #[arg(long, value_enum)]
    input_type: Option<InputFormat>,

    /// Matmul output dtype
    #[arg(long, value_enum)]
    out_dtype: Option<OutputDtype>,

    /// Quantization block size along N
    #[arg(long)]
    block_n: Option<usize>,

    /// Quantization block size along K
    #[arg(long)]
    block_k: Option<usize>,

    /// Tune a single batch size on one device
    #[arg(long)]
    batch_size: Option<usize>,

    /// Directory holding the tuning tables
    #[arg(long, value_name = "DIR")]
    save_path: Option<PathBuf>,

    /// Number of logical host devices
    #[arg(long)]
    devices: Option<usize>,

    /// Threads per logical host device (default: split all cores)
    #[arg(long)]
    threads_per_device: Option<usize>,

    /// Hardware family the host devices model
    #[arg(long, value_enum)]
    family: Option<HardwareFamily>,

    /// Device name used in table file names (default: CPU model)
    #[arg(long)]
    device_name: Option<String>,

    /// Untimed launches per config
    #[arg(long)]
    warmup_iters: Option<usize>,

    /// Timed launches per config
    #[arg(long)]
    iters: Option<usize>,

    /// Divisor applied to the mean latency
    #[arg(long)]
    latency_divisor: Option<f64>,
}

impl Cli {
    fn apply(self, config: &mut TunerConfig) {
        if let Some(v) = self.tp_size {
            config.tp_size = v;
        }
        if let Some(v) = self.input_type {
            config.input_type = v;
        }
        if let Some(v) = self.out_dtype {
            config.out_dtype = v;
        }
        if let Some(v) = self.block_n {
            config.block_n = v;
        }
        if let Some(v) = self.block_k {
            config.block_k = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = Some(v);
        }
        if let Some(v) = self.save_path {
            config.save_path = v;
        }
        if let Some(v) = self.devices {
            config.host.devices = Some(v);
        }
        if let Some(v) = self.threads_per_device {
            config.host.threads_per_device = Some(v);
        }
        if let Some(v) = self.family {
            config.host.family = v;
        }
        if let Some(v) = self.device_name {
            config.host.device_name = Some(v);
        }
        if let Some(v) = self.warmup_iters {
            config.bench.warmup_iters = v;
        }
        if let Some(v) = self.iters {
            config.bench.iters = v;
        }
        if let Some(v) = self.latency_divisor {
            config.bench.latency_divisor = v;
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> TuneResult<()> {
    let mut config = match &cli.config {
        Some(path) => TunerConfig::from_file(path)?,
        None => TunerConfig::default(),
    };
    config.apply_env()?;
    cli.apply(&mut config);
    config.validate()?;
    log::debug!("{config:?}");

    let devices = config.host.devices.unwrap_or(1);
    let family = config.host.family;
    let mut runtime = match config.host.threads_per_device {
        Some(threads) => CpuRuntime::new(devices, threads, family),
        None => CpuRuntime::partitioned(devices, family),
    };
    if let Some(name) = &config.host.device_name {
        runtime = runtime.with_name(name.clone());
    }

    let store = ResultStore::new(&config.save_path);
    let summary = autotuning::run(&runtime, &HostBlockMatmul::new(), &config, &store)?;
    for report in &summary.reports {
        print!("{}", format_report(&report.entries));
    }
    Ok(())
}
