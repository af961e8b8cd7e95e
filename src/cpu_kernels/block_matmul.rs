//! Tiled block-scaled W8A8 matmul on the host.
//!
//! `C[m, n] = sum_k A[m, k] * B[n, k] * As[m, k / block_k] * Bs[n / block_n, k / block_k]`
//!
//! Launch geometry follows the GPU kernel: a 1D grid of
//! `ceil(M / BM) * ceil(N / BN)` programs, each program mapped to an output
//! tile through the `GROUP_SIZE_M` swizzle, each tile reduced over K in
//! `BLOCK_SIZE_K` steps. Programs run on the device's private rayon pool.

use half::{bf16, f16};
use rayon::prelude::*;

use super::dot;
use crate::autotuning::search_space::KernelConfig;
use crate::autotuning::workload::{ScaleTensor, Workload};
use crate::cpu_backend::{CpuDevice, DeviceLimits};
use crate::device::ComputeDevice;
use crate::error::{KernelError, TuneResult};
use crate::traits::BlockMatmul;
use crate::types::{ceil_div, BlockSize, HardwareFamily, OutputDtype};

/// Output matrix `[M, N]` in the requested dtype.
#[derive(Debug, Clone)]
pub enum OutputBuffer {
    F32(Vec<f32>),
    F16(Vec<f16>),
    Bf16(Vec<bf16>),
}

impl OutputBuffer {
    pub fn zeroed(dtype: OutputDtype, len: usize) -> Self {
        match dtype {
            OutputDtype::Float32 => OutputBuffer::F32(vec![0.0; len]),
            OutputDtype::Float16 | OutputDtype::Half => OutputBuffer::F16(vec![f16::ZERO; len]),
            OutputDtype::Bfloat16 => OutputBuffer::Bf16(vec![bf16::ZERO; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            OutputBuffer::F32(v) => v.len(),
            OutputBuffer::F16(v) => v.len(),
            OutputBuffer::Bf16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> f32 {
        match self {
            OutputBuffer::F32(v) => v[idx],
            OutputBuffer::F16(v) => v[idx].to_f32(),
            OutputBuffer::Bf16(v) => v[idx].to_f32(),
        }
    }

    /// Write a `rows x cols` tile at `(row0, col0)` of a row-major matrix
    /// with `ld` columns.
    fn store_tile(&mut self, ld: usize, row0: usize, col0: usize, cols: usize, tile: &[f32]) {
        for (i, src) in tile.chunks_exact(cols).enumerate() {
            let start = (row0 + i) * ld + col0;
            match self {
                OutputBuffer::F32(v) => v[start..start + cols].copy_from_slice(src),
                OutputBuffer::F16(v) => {
                    for (dst, &x) in v[start..start + cols].iter_mut().zip(src) {
                        *dst = f16::from_f32(x);
                    }
                }
                OutputBuffer::Bf16(v) => {
                    for (dst, &x) in v[start..start + cols].iter_mut().zip(src) {
                        *dst = bf16::from_f32(x);
                    }
                }
            }
        }
    }
}

/// K-loop flavour of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelVariant {
    Standard,
    /// K loop unrolled by 4; picked on ROCm-family devices when the whole
    /// grid fits on the compute units in one wave.
    UnrolledK4,
}

impl KernelVariant {
    pub fn select(family: HardwareFamily, num_programs: usize, compute_units: usize) -> Self {
        if family == HardwareFamily::Rocm && num_programs <= compute_units {
            KernelVariant::UnrolledK4
        } else {
            KernelVariant::Standard
        }
    }
}

/// Decoded operands and output for one workload.
#[derive(Debug)]
pub struct HostOperands {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub block: BlockSize,
    /// `[M, K]`, decoded from the quantized bytes
    a: Vec<f32>,
    /// `[N, K]`
    b: Vec<f32>,
    a_scales: ScaleTensor,
    b_scales: ScaleTensor,
    pub out: OutputBuffer,
    /// Variant used by the most recent launch
    pub last_variant: Option<KernelVariant>,
}

/// Reference implementation of [`BlockMatmul`] for [`CpuDevice`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBlockMatmul;

impl HostBlockMatmul {
    pub fn new() -> Self {
        HostBlockMatmul
    }

    /// Reject configs a GPU runtime would refuse to launch.
    pub fn check_launch(limits: &DeviceLimits, block: BlockSize, cfg: &KernelConfig) -> Result<(), KernelError> {
        let (bm, bn, bk) = (cfg.block_size_m, cfg.block_size_n, cfg.block_size_k);
        if bm == 0 || bn == 0 || bk == 0 || cfg.num_warps == 0 || cfg.num_stages == 0 || cfg.group_size_m == 0 {
            return Err(KernelError::Rejected(format!("degenerate launch config {cfg}")));
        }
        if block.block_k % bk != 0 {
            return Err(KernelError::Rejected(format!(
                "BLOCK_SIZE_K={bk} does not divide block_k={}",
                block.block_k
            )));
        }
        // one byte per staged A/B element
        let staged = cfg.num_stages * (bm * bk + bn * bk);
        if staged > limits.shared_mem_bytes {
            return Err(KernelError::Rejected(format!(
                "out of resources: shared memory {staged} > {}",
                limits.shared_mem_bytes
            )));
        }
        let threads = cfg.num_warps * limits.warp_size;
        let acc_regs = ceil_div(bm * bn, threads);
        if acc_regs > limits.max_regs_per_thread {
            return Err(KernelError::Rejected(format!(
                "out of resources: {acc_regs} accumulator registers > {}",
                limits.max_regs_per_thread
            )));
        }
        Ok(())
    }
}

impl BlockMatmul<CpuDevice> for HostBlockMatmul {
    type Operands = HostOperands;

    fn prepare(&self, device: &CpuDevice, workload: Workload, out_dtype: OutputDtype) -> TuneResult<HostOperands> {
        let Workload {
            m,
            shape,
            block,
            a,
            b,
            a_scales,
            b_scales,
        } = workload;
        let (a, b) = device.install(|| {
            let decode = |t: &crate::autotuning::workload::QuantTensor| -> Vec<f32> {
                t.data.par_iter().map(|&byte| t.format.decode(byte)).collect()
            };
            (decode(&a), decode(&b))
        });
        Ok(HostOperands {
            m,
            n: shape.n,
            k: shape.k,
            block,
            a,
            b,
            a_scales,
            b_scales,
            out: OutputBuffer::zeroed(out_dtype, m * shape.n),
            last_variant: None,
        })
    }

    fn run(&self, device: &CpuDevice, ops: &mut HostOperands, cfg: &KernelConfig) -> Result<(), KernelError> {
        Self::check_launch(device.limits(), ops.block, cfg)?;

        let grid_m = ceil_div(ops.m, cfg.block_size_m);
        let grid_n = ceil_div(ops.n, cfg.block_size_n);
        let num_programs = grid_m * grid_n;
        let variant = KernelVariant::select(device.family(), num_programs, device.compute_units());

        let view: &HostOperands = ops;
        let tiles: Vec<(usize, usize, Vec<f32>)> = device.install(|| {
            (0..num_programs)
                .into_par_iter()
                .map(|pid| {
                    let (pid_m, pid_n) = swizzle(pid, grid_m, grid_n, cfg.group_size_m);
                    (pid_m, pid_n, compute_tile(view, pid_m, pid_n, cfg, variant))
                })
                .collect()
        });

        for (pid_m, pid_n, tile) in tiles {
            let row0 = pid_m * cfg.block_size_m;
            let col0 = pid_n * cfg.block_size_n;
            let cols = cfg.block_size_n.min(ops.n - col0);
            ops.out.store_tile(ops.n, row0, col0, cols, &tile);
        }
        ops.last_variant = Some(variant);
        Ok(())
    }
}

/// Map a linear program id to `(pid_m, pid_n)` so that `group_size_m`
/// consecutive row tiles share the same column sweep.
pub fn swizzle(pid: usize, grid_m: usize, grid_n: usize, group_size_m: usize) -> (usize, usize) {
    let in_group = group_size_m * grid_n;
    let group_id = pid / in_group;
    let first_m = group_id * group_size_m;
    let group_rows = (grid_m - first_m).min(group_size_m);
    let local = pid % in_group;
    (first_m + local % group_rows, local / group_rows)
}

fn compute_tile(
    ops: &HostOperands,
    pid_m: usize,
    pid_n: usize,
    cfg: &KernelConfig,
    variant: KernelVariant,
) -> Vec<f32> {
    let (k, block) = (ops.k, ops.block);
    let row0 = pid_m * cfg.block_size_m;
    let col0 = pid_n * cfg.block_size_n;
    let rows = cfg.block_size_m.min(ops.m - row0);
    let cols = cfg.block_size_n.min(ops.n - col0);
    let bk = cfg.block_size_k;

    let mut acc = vec![0f32; rows * cols];
    let mut k0 = 0;
    while k0 < k {
        let k1 = (k0 + bk).min(k);
        let scale_col = k0 / block.block_k;
        for i in 0..rows {
            let a_off = (row0 + i) * k;
            let a_row = &ops.a[a_off + k0..a_off + k1];
            let sa = ops.a_scales.get(row0 + i, scale_col);
            let acc_row = &mut acc[i * cols..(i + 1) * cols];
            for (j, slot) in acc_row.iter_mut().enumerate() {
                let col = col0 + j;
                let b_off = col * k;
                let b_row = &ops.b[b_off + k0..b_off + k1];
                let partial = match variant {
                    KernelVariant::Standard => dot(a_row, b_row),
                    KernelVariant::UnrolledK4 => dot_unrolled4(a_row, b_row),
                };
                *slot += partial * sa * ops.b_scales.get(col / block.block_n, scale_col);
            }
        }
        k0 = k1;
    }
    acc
}

#[inline(always)]
fn dot_unrolled4(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0f32;
    let mut a4 = a.chunks_exact(4);
    let mut b4 = b.chunks_exact(4);
    for (x, y) in (&mut a4).zip(&mut b4) {
        sum += x[0] * y[0] + x[1] * y[1] + x[2] * y[2] + x[3] * y[3];
    }
    for (x, y) in a4.remainder().iter().zip(b4.remainder()) {
        sum += x * y;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_backend::CpuRuntime;
    use crate::device::DeviceRuntime;
    use crate::types::{QuantFormat, WeightShape};
    use std::collections::HashSet;

    fn reference(w: &Workload) -> Vec<f32> {
        let (m, n, k) = (w.m, w.shape.n, w.shape.k);
        let mut out = vec![0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut s = 0f32;
                for kk in 0..k {
                    let sc = w.a_scales.get(i, kk / w.block.block_k) * w.b_scales.get(j / w.block.block_n, kk / w.block.block_k);
                    s += w.a.value(i, kk) * w.b.value(j, kk) * sc;
                }
                out[i * n + j] = s;
            }
        }
        out
    }

    fn assert_close(got: &OutputBuffer, want: &[f32], tol: f32) {
        assert_eq!(got.len(), want.len());
        for (idx, &w) in want.iter().enumerate() {
            let g = got.get(idx);
            assert!((g - w).abs() <= tol * (1.0 + w.abs()), "idx {idx}: got {g}, want {w}");
        }
    }

    #[test]
    fn test_matches_reference_across_configs() {
        let rt = CpuRuntime::new(1, 2, HardwareFamily::Cuda);
        let dev = rt.bind(0).unwrap();
        let block = BlockSize::new(32, 32);
        let w = Workload::synthesize(19, WeightShape::new(70, 96), block, QuantFormat::Int8);
        let want = reference(&w);
        let kernel = HostBlockMatmul::new();
        let mut ops = kernel.prepare(&dev, w, OutputDtype::Float32).unwrap();
        for cfg in [
            KernelConfig::new(16, 32, 32, 1, 4, 2),
            KernelConfig::new(32, 16, 16, 4, 4, 3),
            KernelConfig::new(64, 64, 32, 16, 8, 2),
            KernelConfig::new(16, 16, 8, 2, 4, 2),
        ] {
            kernel.run(&dev, &mut ops, &cfg).unwrap();
            assert_close(&ops.out, &want, 1e-4);
        }
    }

    #[test]
    fn test_half_outputs() {
        let rt = CpuRuntime::new(1, 1, HardwareFamily::Cuda);
        let dev = rt.bind(0).unwrap();
        let block = BlockSize::new(16, 16);
        for dtype in [OutputDtype::Float16, OutputDtype::Bfloat16, OutputDtype::Half] {
            let w = Workload::synthesize(4, WeightShape::new(24, 32), block, QuantFormat::Fp8E4m3Fn);
            let want = reference(&w);
            let kernel = HostBlockMatmul::new();
            let mut ops = kernel.prepare(&dev, w, dtype).unwrap();
            kernel.run(&dev, &mut ops, &KernelConfig::new(16, 16, 16, 1, 4, 2)).unwrap();
            assert_close(&ops.out, &want, 1e-2);
        }
    }

    #[test]
    fn test_swizzle_is_a_permutation() {
        for (grid_m, grid_n, group) in [(5, 3, 1), (5, 3, 2), (7, 4, 4), (3, 9, 64), (1, 1, 32)] {
            let seen: HashSet<_> = (0..grid_m * grid_n).map(|pid| swizzle(pid, grid_m, grid_n, group)).collect();
            assert_eq!(seen.len(), grid_m * grid_n);
            assert!(seen.iter().all(|&(m, n)| m < grid_m && n < grid_n));
        }
    }

    #[test]
    fn test_swizzle_groups_rows() {
        // group of 2 rows walks down the rows before moving right
        assert_eq!(swizzle(0, 4, 3, 2), (0, 0));
        assert_eq!(swizzle(1, 4, 3, 2), (1, 0));
        assert_eq!(swizzle(2, 4, 3, 2), (0, 1));
        assert_eq!(swizzle(6, 4, 3, 2), (2, 0));
    }

    #[test]
    fn test_rejects_shared_memory_overflow() {
        let limits = DeviceLimits::for_family(HardwareFamily::Rocm);
        let cfg = KernelConfig::new(256, 256, 128, 1, 8, 2);
        let err = HostBlockMatmul::check_launch(&limits, BlockSize::default(), &cfg).unwrap_err();
        assert!(matches!(err, KernelError::Rejected(ref msg) if msg.contains("shared memory")));
    }

    #[test]
    fn test_rejects_register_overflow() {
        let limits = DeviceLimits {
            shared_mem_bytes: usize::MAX,
            max_regs_per_thread: 255,
            warp_size: 32,
        };
        let cfg = KernelConfig::new(256, 256, 64, 1, 4, 2);
        let err = HostBlockMatmul::check_launch(&limits, BlockSize::default(), &cfg).unwrap_err();
        assert!(matches!(err, KernelError::Rejected(ref msg) if msg.contains("registers")));
    }

    #[test]
    fn test_rejects_non_dividing_k_tile() {
        let limits = DeviceLimits::for_family(HardwareFamily::Cuda);
        let cfg = KernelConfig::new(16, 32, 256, 1, 4, 2);
        assert!(HostBlockMatmul::check_launch(&limits, BlockSize::default(), &cfg).is_err());
    }

    #[test]
    fn test_rocm_small_grid_uses_unrolled_variant() {
        assert_eq!(KernelVariant::select(HardwareFamily::Rocm, 4, 8), KernelVariant::UnrolledK4);
        assert_eq!(KernelVariant::select(HardwareFamily::Rocm, 9, 8), KernelVariant::Standard);
        assert_eq!(KernelVariant::select(HardwareFamily::Cuda, 1, 8), KernelVariant::Standard);

        let rt = CpuRuntime::new(1, 4, HardwareFamily::Rocm);
        let dev = rt.bind(0).unwrap();
        let w = Workload::synthesize(8, WeightShape::new(32, 64), BlockSize::new(32, 32), QuantFormat::Fp8E4m3Fnuz);
        let want = reference(&w);
        let kernel = HostBlockMatmul::new();
        let mut ops = kernel.prepare(&dev, w, OutputDtype::Float32).unwrap();
        kernel.run(&dev, &mut ops, &KernelConfig::new(32, 16, 32, 1, 4, 2)).unwrap();
        assert_eq!(ops.last_variant, Some(KernelVariant::UnrolledK4));
        assert_close(&ops.out, &want, 1e-4);
    }
}
