//! # Host reference kernels
//!
//! The block-scaled W8A8 matmul executed on a [`CpuDevice`](crate::cpu_backend::CpuDevice).
//! It honours every launch parameter the tuner varies, so relative timings
//! between configs are meaningful on the host, and it rejects configs that
//! would exceed the modelled device budgets the way a GPU runtime does.
//!
//! The inner dot product width is picked once per process from the host ISA:
//!
//! | ISA | lanes |
//! |---|---|
//! | AVX-512 | 16 |
//! | AVX2 / NEON | 8 |
//! | scalar | 4 |

use std::sync::OnceLock;

pub mod block_matmul;

pub use block_matmul::{HostBlockMatmul, HostOperands, KernelVariant, OutputBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsaLevel {
    Scalar,
    Avx2,
    Avx512,
    Neon,
}

impl IsaLevel {
    /// Accumulator lanes used by the inner K loop.
    pub fn lanes(&self) -> usize {
        match self {
            IsaLevel::Avx512 => 16,
            IsaLevel::Avx2 | IsaLevel::Neon => 8,
            IsaLevel::Scalar => 4,
        }
    }
}

static ISA_LEVEL: OnceLock<IsaLevel> = OnceLock::new();

pub fn get_isa_level() -> IsaLevel {
    *ISA_LEVEL.get_or_init(|| {
        let level = detect_isa_features();
        log::debug!("host kernel ISA level: {level:?}");
        level
    })
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_isa_features() -> IsaLevel {
    if is_x86_feature_detected!("avx512f") {
        IsaLevel::Avx512
    } else if is_x86_feature_detected!("avx2") {
        IsaLevel::Avx2
    } else {
        IsaLevel::Scalar
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_isa_features() -> IsaLevel {
    IsaLevel::Neon
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_isa_features() -> IsaLevel {
    IsaLevel::Scalar
}

/// `sum(a[i] * b[i])` with `L` independent accumulators.
#[inline(always)]
pub(crate) fn dot_lanes<const L: usize>(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0f32; L];
    let mut a_chunks = a.chunks_exact(L);
    let mut b_chunks = b.chunks_exact(L);
    for (ca, cb) in (&mut a_chunks).zip(&mut b_chunks) {
        for l in 0..L {
            acc[l] += ca[l] * cb[l];
        }
    }
    let mut sum: f32 = acc.iter().sum();
    for (x, y) in a_chunks.remainder().iter().zip(b_chunks.remainder()) {
        sum += x * y;
    }
    sum
}

/// ISA-dispatched dot product.
#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    match get_isa_level() {
        IsaLevel::Avx512 => dot_lanes::<16>(a, b),
        IsaLevel::Avx2 | IsaLevel::Neon => dot_lanes::<8>(a, b),
        IsaLevel::Scalar => dot_lanes::<4>(a, b),
    }
}
