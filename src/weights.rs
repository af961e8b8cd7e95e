//! Weight-shape and batch-size axes of the tuning grid.
//!
//! The shape table covers the block-quantized linear layers of DeepSeek-V3.
//! Tuning another model means supplying a different table through
//! `TunerConfig::weight_shapes`.

use crate::types::WeightShape;

/// Default batch-size sweep (the M axis).
pub const DEFAULT_BATCH_SIZES: &[usize] = &[
    1, 2, 4, 8, 16, 24, 32, 48, 64, 96, 128, 256, 512, 1024, 1536, 2048, 3072, 4096,
];

/// Layers that are never split across tensor-parallel ranks.
const REPLICATED: &[(usize, usize)] = &[
    (512 + 64, 7168),
    ((128 + 64) * 128, 7168),
    (128 * (128 + 128), 512),
    (7168, 16384),
    (7168, 18432),
];

/// Column-parallel layers: N is divided by the TP degree.
const N_PARALLEL: &[(usize, usize)] = &[
    (18432 * 2, 7168),
    ((128 + 64) * 128, 7168),
    (128 * (128 + 128), 512),
    (24576, 1536),
    (4096, 7168),
];

/// Row-parallel layers: K is divided by the TP degree.
const K_PARALLEL: &[(usize, usize)] = &[(7168, 18432), (7168, 16384), (7168, 2048)];

/// Weight shapes seen by one rank at tensor-parallel degree `tp_size`.
///
/// Order is replicated, then N-split, then K-split; workers tune shapes in
/// exactly this order. Duplicates are kept since they come from distinct
/// layers and re-tuning one merges idempotently.
pub fn deepseek_v3_weight_shapes(tp_size: usize) -> Vec<WeightShape> {
    let tp = tp_size.max(1);
    let mut shapes = Vec::with_capacity(REPLICATED.len() + N_PARALLEL.len() + K_PARALLEL.len());
    shapes.extend(REPLICATED.iter().map(|&(n, k)| WeightShape::new(n, k)));
    shapes.extend(N_PARALLEL.iter().map(|&(n, k)| WeightShape::new(n / tp, k)));
    shapes.extend(K_PARALLEL.iter().map(|&(n, k)| WeightShape::new(n, k / tp)));
    shapes
}
