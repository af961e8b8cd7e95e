//! Exhaustive search over the candidate list.
//!
//! For each batch size the operands are synthesized and prepared once, then
//! every candidate is measured on them. The winner is the strictly lowest
//! mean latency; on an exact tie the candidate seen first keeps the slot.
//! A shape is only usable when every batch size finds a winner.

use std::time::Instant;

use crate::autotuning::cache::TuningTable;
use crate::autotuning::measure::{measure, BenchConfig, BenchOutcome, BenchResult};
use crate::autotuning::search_space::KernelConfig;
use crate::autotuning::workload::Workload;
use crate::device::ComputeDevice;
use crate::error::{TuneError, TuneResult};
use crate::traits::BlockMatmul;
use crate::types::{BlockSize, OutputDtype, QuantFormat, WeightShape};

/// Settings shared by every search on one device.
#[derive(Debug, Clone, Copy)]
pub struct TuneSession<'a> {
    /// Candidates, already filtered for the quantization block
    pub candidates: &'a [KernelConfig],
    pub block: BlockSize,
    pub format: QuantFormat,
    pub out_dtype: OutputDtype,
    pub bench: &'a BenchConfig,
}

/// Winner for one (shape, batch size) plus search bookkeeping.
#[derive(Debug, Clone)]
pub struct TunedEntry {
    pub shape: WeightShape,
    pub batch_size: usize,
    pub config: KernelConfig,
    pub result: BenchResult,
    /// Candidates that completed a measurement
    pub evaluated: usize,
    /// Candidates the runtime refused
    pub rejected: usize,
    /// Wall time spent on this batch size (nanoseconds)
    pub search_time_ns: u64,
}

impl std::fmt::Display for TunedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} M={}: {} | {} | {} ok, {} rejected in {:.1}s",
            self.shape,
            self.batch_size,
            self.config,
            self.result,
            self.evaluated,
            self.rejected,
            self.search_time_ns as f64 / 1e9,
        )
    }
}

/// Find the fastest candidate for batch size `m` on `shape`.
pub fn tune_batch_size<D, K>(
    device: &D,
    kernel: &K,
    session: &TuneSession<'_>,
    m: usize,
    shape: WeightShape,
) -> TuneResult<TunedEntry>
where
    D: ComputeDevice,
    K: BlockMatmul<D>,
{
    let t0 = Instant::now();
    let workload = Workload::synthesize(m, shape, session.block, session.format);
    let flops = 2 * (m * shape.n * shape.k) as u64;
    let mut operands = kernel.prepare(device, workload, session.out_dtype)?;

    let mut best: Option<(KernelConfig, BenchResult)> = None;
    let mut evaluated = 0usize;
    let mut rejected = 0usize;

    for cfg in session.candidates {
        match measure(device, kernel, &mut operands, cfg, session.bench)? {
            BenchOutcome::Completed(result) => {
                evaluated += 1;
                log::debug!("[device {}] {shape} M={m} {cfg}: {result}", device.ordinal());
                let better = match &best {
                    Some((_, incumbent)) => result.mean_us < incumbent.mean_us,
                    None => true,
                };
                if better {
                    best = Some((cfg.clone(), result));
                }
            }
            BenchOutcome::Rejected { reason } => {
                rejected += 1;
                log::debug!("[device {}] {shape} M={m} {cfg} rejected: {reason}", device.ordinal());
            }
        }
    }

    let Some((config, result)) = best else {
        log::warn!(
            "[device {}] {shape} M={m}: all {} candidates rejected",
            device.ordinal(),
            session.candidates.len()
        );
        return Err(TuneError::NoViableConfig {
            n: shape.n,
            k: shape.k,
            batch_size: m,
            rejected,
        });
    };

    Ok(TunedEntry {
        shape,
        batch_size: m,
        config,
        result: result.with_flops(flops),
        evaluated,
        rejected,
        search_time_ns: t0.elapsed().as_nanos() as u64,
    })
}

/// Tune every batch size for one shape, in the order given.
///
/// Fails on the first batch size without a viable config; nothing from
/// this shape should be persisted in that case.
pub fn tune_shape<D, K>(
    device: &D,
    kernel: &K,
    session: &TuneSession<'_>,
    shape: WeightShape,
    batch_sizes: &[usize],
) -> TuneResult<(TuningTable, Vec<TunedEntry>)>
where
    D: ComputeDevice,
    K: BlockMatmul<D>,
{
    let mut table = TuningTable::new();
    let mut entries = Vec::with_capacity(batch_sizes.len());
    for &m in batch_sizes {
        let entry = tune_batch_size(device, kernel, session, m, shape)?;
        log::info!("[device {}] {entry}", device.ordinal());
        table.insert(m, entry.config.clone());
        entries.push(entry);
    }
    Ok((table, entries))
}

/// Human-readable summary of tuned entries.
pub fn format_report(entries: &[TunedEntry]) -> String {
    let mut out = String::new();
    out.push_str("=== Block-wise W8A8 tuning report ===\n");
    for e in entries {
        out.push_str(&format!(
            "  {:<16} M={:<5} {:>10.2}us  {}  ({} ok / {} rejected)\n",
            e.shape.to_string(),
            e.batch_size,
            e.result.mean_us,
            e.config,
            e.evaluated,
            e.rejected,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::types::HardwareFamily;
    use std::cell::Cell;
    use std::collections::HashMap;

    /// Device with a virtual clock advanced by the kernel.
    #[derive(Default)]
    struct VirtualDevice {
        clock_ms: Cell<f64>,
    }

    impl ComputeDevice for VirtualDevice {
        type Timer = f64;

        fn ordinal(&self) -> usize {
            0
        }
        fn name(&self) -> &str {
            "Virtual GPU"
        }
        fn family(&self) -> HardwareFamily {
            HardwareFamily::Cuda
        }
        fn compute_units(&self) -> usize {
            132
        }
        fn synchronize(&self) -> TuneResult<()> {
            Ok(())
        }
        fn start_timer(&self) -> TuneResult<f64> {
            Ok(self.clock_ms.get())
        }
        fn stop_timer(&self, start: f64) -> TuneResult<f64> {
            Ok(self.clock_ms.get() - start)
        }
    }

    /// Kernel whose cost per config is looked up by BLOCK_SIZE_M; missing
    /// entries are rejected.
    struct TableKernel {
        cost_ms: HashMap<usize, f64>,
    }

    impl BlockMatmul<VirtualDevice> for TableKernel {
        type Operands = ();

        fn prepare(&self, _: &VirtualDevice, _: Workload, _: OutputDtype) -> TuneResult<()> {
            Ok(())
        }

        fn run(&self, dev: &VirtualDevice, _: &mut (), cfg: &KernelConfig) -> Result<(), KernelError> {
            match self.cost_ms.get(&cfg.block_size_m) {
                Some(ms) => {
                    dev.clock_ms.set(dev.clock_ms.get() + ms);
                    Ok(())
                }
                None => Err(KernelError::Rejected("out of resources".into())),
            }
        }
    }

    fn candidates() -> Vec<KernelConfig> {
        [16, 32, 64, 128]
            .into_iter()
            .map(|bm| KernelConfig::new(bm, 32, 64, 1, 4, 2))
            .collect()
    }

    fn session<'a>(candidates: &'a [KernelConfig], bench: &'a BenchConfig) -> TuneSession<'a> {
        TuneSession {
            candidates,
            block: BlockSize::new(16, 64),
            format: QuantFormat::Int8,
            out_dtype: OutputDtype::Float16,
            bench,
        }
    }

    #[test]
    fn test_picks_lowest_latency() {
        let kernel = TableKernel {
            cost_ms: HashMap::from([(16, 3.0), (32, 1.0), (64, 2.0), (128, 5.0)]),
        };
        let cands = candidates();
        let bench = BenchConfig::default();
        let entry = tune_batch_size(&VirtualDevice::default(), &kernel, &session(&cands, &bench), 4, WeightShape::new(64, 64)).unwrap();
        assert_eq!(entry.config.block_size_m, 32);
        assert_eq!(entry.evaluated, 4);
        assert_eq!(entry.rejected, 0);
        // 1ms per launch / divisor 10
        assert!((entry.result.mean_us - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_tie_keeps_first_seen() {
        let kernel = TableKernel {
            cost_ms: HashMap::from([(16, 2.0), (32, 1.0), (64, 1.0), (128, 1.0)]),
        };
        let cands = candidates();
        let bench = BenchConfig::default();
        let entry = tune_batch_size(&VirtualDevice::default(), &kernel, &session(&cands, &bench), 1, WeightShape::new(64, 64)).unwrap();
        assert_eq!(entry.config.block_size_m, 32);
    }

    #[test]
    fn test_rejected_candidates_are_skipped() {
        let kernel = TableKernel {
            cost_ms: HashMap::from([(64, 4.0)]),
        };
        let cands = candidates();
        let bench = BenchConfig::default();
        let entry = tune_batch_size(&VirtualDevice::default(), &kernel, &session(&cands, &bench), 8, WeightShape::new(64, 64)).unwrap();
        assert_eq!(entry.config.block_size_m, 64);
        assert_eq!(entry.evaluated, 1);
        assert_eq!(entry.rejected, 3);
    }

    #[test]
    fn test_all_rejected_is_no_viable_config() {
        let kernel = TableKernel { cost_ms: HashMap::new() };
        let cands = candidates();
        let bench = BenchConfig::default();
        let err = tune_batch_size(&VirtualDevice::default(), &kernel, &session(&cands, &bench), 8, WeightShape::new(576, 7168)).unwrap_err();
        assert!(matches!(
            err,
            TuneError::NoViableConfig {
                n: 576,
                k: 7168,
                batch_size: 8,
                rejected: 4
            }
        ));
    }

    #[test]
    fn test_empty_candidate_list_is_no_viable_config() {
        let kernel = TableKernel { cost_ms: HashMap::new() };
        let bench = BenchConfig::default();
        let err = tune_batch_size(&VirtualDevice::default(), &kernel, &session(&[], &bench), 8, WeightShape::new(64, 64)).unwrap_err();
        assert!(matches!(err, TuneError::NoViableConfig { rejected: 0, .. }));
    }

    #[test]
    fn test_tune_shape_covers_batch_sizes_in_order() {
        let kernel = TableKernel {
            cost_ms: HashMap::from([(16, 3.0), (32, 1.0)]),
        };
        let cands = candidates();
        let bench = BenchConfig::fast();
        let (table, entries) =
            tune_shape(&VirtualDevice::default(), &kernel, &session(&cands, &bench), WeightShape::new(64, 64), &[64, 1, 8]).unwrap();
        assert_eq!(table.batch_sizes(), vec![1, 8, 64]);
        assert_eq!(entries.iter().map(|e| e.batch_size).collect::<Vec<_>>(), vec![64, 1, 8]);
        assert!(table.iter().all(|(_, cfg)| cfg.block_size_m == 32));
        assert!(format_report(&entries).contains("M=64"));
    }
}
