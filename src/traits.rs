//! Kernel seam: the block-scaled W8A8 matmul under tune.
//!
//! The tuner never looks inside the kernel. It hands over a synthetic
//! workload once per batch size, then launches it repeatedly with different
//! launch configs. A launch either completes, is rejected by the runtime
//! (too much shared memory, too many registers), or faults.

use crate::autotuning::search_space::KernelConfig;
use crate::autotuning::workload::Workload;
use crate::device::ComputeDevice;
use crate::error::{KernelError, TuneResult};
use crate::types::OutputDtype;

/// `C = (A * As) @ (B * Bs)^T` with per-block scales, for device type `D`.
pub trait BlockMatmul<D: ComputeDevice>: Sync {
    /// Device-resident operands and output buffer for one workload.
    type Operands;

    /// Upload/allocate everything a launch needs. Called once per batch size.
    fn prepare(&self, device: &D, workload: Workload, out_dtype: OutputDtype) -> TuneResult<Self::Operands>;

    /// Enqueue one launch with `config`.
    ///
    /// Must return [`KernelError::Rejected`] when the config cannot run on
    /// this device for this problem size, and [`KernelError::Fatal`] for
    /// anything else.
    fn run(&self, device: &D, operands: &mut Self::Operands, config: &KernelConfig) -> Result<(), KernelError>;
}
