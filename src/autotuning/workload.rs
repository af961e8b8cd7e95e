//! Synthetic operands for timing runs.
//!
//! Values are random and only need to be in range; nothing downstream
//! checks numerical results. Scale tensors use ceiling division so a ragged
//! last block along N or K still gets a scale.

use rand::Rng;
use rayon::prelude::*;

use crate::types::{ceil_div, BlockSize, QuantFormat, WeightShape};

/// Keeps the dequantized product in a sane range.
pub const SCALE_SHRINK: f32 = 1e-2;

/// Row-major 2D tensor of quantized bytes.
#[derive(Debug, Clone)]
pub struct QuantTensor {
    pub format: QuantFormat,
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<u8>,
}

impl QuantTensor {
    /// Uniform in `[-max, max)`, clamped to the format range, then encoded.
    pub fn random(rows: usize, cols: usize, format: QuantFormat) -> Self {
        let max = format.max_value();
        let min = format.min_value();
        let mut data = vec![0u8; rows * cols];
        data.par_iter_mut().for_each_init(rand::thread_rng, |rng, slot| {
            let v: f32 = (rng.gen::<f32>() - 0.5) * 2.0 * max;
            *slot = format.encode(v.clamp(min, max));
        });
        Self {
            format,
            rows,
            cols,
            data,
        }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    #[inline(always)]
    pub fn value(&self, row: usize, col: usize) -> f32 {
        self.format.decode(self.data[row * self.cols + col])
    }
}

/// Row-major 2D tensor of f32 scale factors.
#[derive(Debug, Clone)]
pub struct ScaleTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl ScaleTensor {
    /// `U[0, 1) * SCALE_SHRINK`.
    pub fn random(rows: usize, cols: usize) -> Self {
        let mut data = vec![0f32; rows * cols];
        data.par_iter_mut().for_each_init(rand::thread_rng, |rng, slot| {
            *slot = rng.gen::<f32>() * SCALE_SHRINK;
        });
        Self { rows, cols, data }
    }

    pub fn shape(&self) -> [usize; 2] {
        [self.rows, self.cols]
    }

    #[inline(always)]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }
}

/// Inputs for one (M, N, K) timing problem.
#[derive(Debug, Clone)]
pub struct Workload {
    /// Batch size (rows of A)
    pub m: usize,
    pub shape: WeightShape,
    pub block: BlockSize,
    /// Activations `[M, K]`
    pub a: QuantTensor,
    /// Weights `[N, K]`
    pub b: QuantTensor,
    /// Per-token-group scales `[M, ceil(K / block_k)]`
    pub a_scales: ScaleTensor,
    /// Per-block scales `[ceil(N / block_n), ceil(K / block_k)]`
    pub b_scales: ScaleTensor,
}

impl Workload {
    pub fn synthesize(m: usize, shape: WeightShape, block: BlockSize, format: QuantFormat) -> Self {
        let WeightShape { n, k } = shape;
        let n_tiles = ceil_div(n, block.block_n);
        let k_tiles = ceil_div(k, block.block_k);

        Workload {
            m,
            shape,
            block,
            a: QuantTensor::random(m, k, format),
            b: QuantTensor::random(n, k, format),
            a_scales: ScaleTensor::random(m, k_tiles),
            b_scales: ScaleTensor::random(n_tiles, k_tiles),
        }
    }

    pub fn format(&self) -> QuantFormat {
        self.a.format
    }

    /// Bytes touched by one matmul: A + B + scales + output.
    pub fn footprint_bytes(&self, out_elem_bytes: usize) -> usize {
        self.a.data.len()
            + self.b.data.len()
            + (self.a_scales.data.len() + self.b_scales.data.len()) * 4
            + self.m * self.shape.n * out_elem_bytes
    }
}
