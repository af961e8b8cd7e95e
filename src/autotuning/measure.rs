//! Latency measurement for one launch config.
//!
//! Protocol: synchronize, run `warmup_iters` untimed launches (the first
//! one pays any JIT compilation), synchronize, then time `iters` single
//! launches with the device timer, synchronizing before each. The reported
//! mean is `sum_ms / (iters * latency_divisor) * 1000` microseconds.
//!
//! A launch the runtime refuses is not an error here: it turns into
//! [`BenchOutcome::Rejected`] and the search moves on. Faults and device
//! errors propagate.

use serde::{Deserialize, Serialize};

use super::search_space::KernelConfig;
use crate::device::ComputeDevice;
use crate::error::{KernelError, TuneError, TuneResult};
use crate::traits::BlockMatmul;

/// Result of benchmarking a single configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchResult {
    /// Normalized mean latency in microseconds
    pub mean_us: f64,
    /// Fastest raw sample in milliseconds
    pub min_ms: f64,
    /// Slowest raw sample in milliseconds
    pub max_ms: f64,
    /// Number of timed samples
    pub samples: usize,
    /// Throughput derived from `mean_us` (if a FLOP count was supplied)
    pub tflops: Option<f64>,
}

impl BenchResult {
    /// Attach a throughput figure for `flops` floating-point operations.
    pub fn with_flops(mut self, flops: u64) -> Self {
        if self.mean_us > 0.0 {
            self.tflops = Some(flops as f64 / (self.mean_us * 1e6));
        }
        self
    }
}

impl std::fmt::Display for BenchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean={:.2}us min={:.3}ms max={:.3}ms n={}",
            self.mean_us, self.min_ms, self.max_ms, self.samples
        )?;
        if let Some(tf) = self.tflops {
            write!(f, " {tf:.2}TFLOPS")?;
        }
        Ok(())
    }
}

/// What happened when a config was benchmarked.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchOutcome {
    Completed(BenchResult),
    /// The runtime refused the config; carries the runtime's reason.
    Rejected { reason: String },
}

/// Configuration for the benchmark harness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Untimed launches before measuring
    pub warmup_iters: usize,
    /// Timed launches
    pub iters: usize,
    /// Extra divisor on the mean; 10 keeps latencies comparable with
    /// historical tables
    pub latency_divisor: f64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            warmup_iters: 5,
            iters: 10,
            latency_divisor: 10.0,
        }
    }
}

impl BenchConfig {
    /// Cheap settings for smoke runs on the host runtime.
    pub fn fast() -> Self {
        BenchConfig {
            warmup_iters: 1,
            iters: 2,
            latency_divisor: 10.0,
        }
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.iters == 0 {
            return Err(TuneError::InvalidConfig("bench.iters must be at least 1".into()));
        }
        if !(self.latency_divisor.is_finite() && self.latency_divisor > 0.0) {
            return Err(TuneError::InvalidConfig(format!(
                "bench.latency_divisor must be positive, got {}",
                self.latency_divisor
            )));
        }
        Ok(())
    }
}

/// Benchmark `config` on already-prepared operands.
pub fn measure<D, K>(
    device: &D,
    kernel: &K,
    operands: &mut K::Operands,
    config: &KernelConfig,
    bench: &BenchConfig,
) -> TuneResult<BenchOutcome>
where
    D: ComputeDevice,
    K: BlockMatmul<D>,
{
    macro_rules! launch {
        () => {
            match kernel.run(device, operands, config) {
                Ok(()) => {}
                Err(KernelError::Rejected(reason)) => return Ok(BenchOutcome::Rejected { reason }),
                Err(fatal @ KernelError::Fatal(_)) => return Err(fatal.into()),
            }
        };
    }

    device.synchronize()?;
    for _ in 0..bench.warmup_iters {
        launch!();
    }
    device.synchronize()?;

    let mut samples_ms = Vec::with_capacity(bench.iters);
    for _ in 0..bench.iters {
        device.synchronize()?;
        let timer = device.start_timer()?;
        launch!();
        samples_ms.push(device.stop_timer(timer)?);
    }

    Ok(BenchOutcome::Completed(summarize(&samples_ms, bench.latency_divisor)))
}

fn summarize(samples_ms: &[f64], latency_divisor: f64) -> BenchResult {
    let n = samples_ms.len();
    let sum: f64 = samples_ms.iter().sum();
    let min_ms = samples_ms.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = samples_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    BenchResult {
        mean_us: sum / (n as f64 * latency_divisor) * 1000.0,
        min_ms: if n == 0 { 0.0 } else { min_ms },
        max_ms: if n == 0 { 0.0 } else { max_ms },
        samples: n,
        tflops: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autotuning::workload::Workload;
    use crate::types::{HardwareFamily, OutputDtype};
    use std::cell::{Cell, RefCell};

    /// Device whose timer reports a scripted duration per sample.
    struct ScriptedDevice {
        durations: RefCell<Vec<f64>>,
        syncs: Cell<usize>,
    }

    impl ComputeDevice for ScriptedDevice {
        type Timer = ();

        fn ordinal(&self) -> usize {
            0
        }
        fn name(&self) -> &str {
            "Scripted"
        }
        fn family(&self) -> HardwareFamily {
            HardwareFamily::Cuda
        }
        fn compute_units(&self) -> usize {
            1
        }
        fn synchronize(&self) -> TuneResult<()> {
            self.syncs.set(self.syncs.get() + 1);
            Ok(())
        }
        fn start_timer(&self) -> TuneResult<()> {
            Ok(())
        }
        fn stop_timer(&self, _: ()) -> TuneResult<f64> {
            Ok(self.durations.borrow_mut().remove(0))
        }
    }

    /// Kernel that counts launches and fails on a chosen launch index.
    struct CountingKernel {
        fail_at: Option<(usize, KernelError)>,
    }

    impl BlockMatmul<ScriptedDevice> for CountingKernel {
        type Operands = usize;

        fn prepare(&self, _: &ScriptedDevice, _: Workload, _: OutputDtype) -> TuneResult<usize> {
            Ok(0)
        }

        fn run(&self, _: &ScriptedDevice, launches: &mut usize, _: &KernelConfig) -> Result<(), KernelError> {
            let idx = *launches;
            *launches += 1;
            match &self.fail_at {
                Some((at, err)) if *at == idx => Err(err.clone()),
                _ => Ok(()),
            }
        }
    }

    fn device(durations: &[f64]) -> ScriptedDevice {
        ScriptedDevice {
            durations: RefCell::new(durations.to_vec()),
            syncs: Cell::new(0),
        }
    }

    #[test]
    fn test_mean_uses_latency_divisor() {
        let dev = device(&[1.0, 2.0, 3.0, 2.0]);
        let kernel = CountingKernel { fail_at: None };
        let mut launches = 0;
        let bench = BenchConfig {
            warmup_iters: 5,
            iters: 4,
            latency_divisor: 10.0,
        };
        let cfg = KernelConfig::new(16, 32, 64, 1, 4, 2);
        let outcome = measure(&dev, &kernel, &mut launches, &cfg, &bench).unwrap();
        let BenchOutcome::Completed(res) = outcome else {
            panic!("expected completion");
        };
        // 8ms / (4 * 10) * 1000
        assert!((res.mean_us - 200.0).abs() < 1e-9);
        assert_eq!(res.min_ms, 1.0);
        assert_eq!(res.max_ms, 3.0);
        assert_eq!(res.samples, 4);
        assert_eq!(launches, 9);
        // before warmup, after warmup, before each sample
        assert_eq!(dev.syncs.get(), 2 + 4);
    }

    #[test]
    fn test_rejection_during_warmup() {
        let dev = device(&[]);
        let kernel = CountingKernel {
            fail_at: Some((0, KernelError::Rejected("out of resources".into()))),
        };
        let mut launches = 0;
        let cfg = KernelConfig::new(256, 256, 128, 1, 4, 5);
        let outcome = measure(&dev, &kernel, &mut launches, &cfg, &BenchConfig::default()).unwrap();
        assert_eq!(
            outcome,
            BenchOutcome::Rejected {
                reason: "out of resources".into()
            }
        );
        assert_eq!(launches, 1);
    }

    #[test]
    fn test_fatal_error_propagates() {
        let dev = device(&[1.0; 10]);
        let kernel = CountingKernel {
            fail_at: Some((7, KernelError::Fatal("illegal address".into()))),
        };
        let mut launches = 0;
        let cfg = KernelConfig::new(16, 32, 64, 1, 4, 2);
        let err = measure(&dev, &kernel, &mut launches, &cfg, &BenchConfig::default()).unwrap_err();
        assert!(matches!(err, TuneError::Kernel(ref m) if m.contains("illegal address")));
    }

    #[test]
    fn test_validate() {
        assert!(BenchConfig::default().validate().is_ok());
        let zero = BenchConfig {
            iters: 0,
            ..BenchConfig::default()
        };
        assert!(zero.validate().is_err());
        let neg = BenchConfig {
            latency_divisor: 0.0,
            ..BenchConfig::default()
        };
        assert!(neg.validate().is_err());
    }

    #[test]
    fn test_throughput() {
        let res = summarize(&[1.0], 1.0).with_flops(2_000_000_000);
        // 2 GFLOP in 1 ms
        assert!((res.tflops.unwrap() - 2.0).abs() < 1e-9);
    }
}
