//! Core value types shared by every tuning stage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TuneError;

/// Ceiling division; the tile count for a possibly ragged last tile.
#[inline(always)]
pub fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Weight matrix dimensions after tensor-parallel partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeightShape {
    /// Output dimension
    pub n: usize,
    /// Reduction dimension
    pub k: usize,
}

impl WeightShape {
    pub const fn new(n: usize, k: usize) -> Self {
        Self { n, k }
    }
}

impl fmt::Display for WeightShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N={} K={}", self.n, self.k)
    }
}

/// Quantization granularity `[block_n, block_k]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockSize {
    pub block_n: usize,
    pub block_k: usize,
}

impl BlockSize {
    pub const fn new(block_n: usize, block_k: usize) -> Self {
        Self { block_n, block_k }
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::new(128, 128)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.block_n, self.block_k)
    }
}

/// Hardware family tag; selects the config-space policy and the fp8 flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HardwareFamily {
    /// NVIDIA-style: deep software pipelining, e4m3fn.
    Cuda,
    /// AMD-style: wide CU counts, single pipeline stage count, e4m3fnuz.
    Rocm,
}

impl HardwareFamily {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Rocm => "rocm",
        }
    }
}

/// Activation/weight numeric format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    #[default]
    Fp8,
    Int8,
}

impl InputFormat {
    /// Name used in persisted table file names.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fp8 => "fp8",
            Self::Int8 => "int8",
        }
    }

    /// Resolve the concrete storage format for a hardware family.
    pub fn resolve(&self, family: HardwareFamily) -> QuantFormat {
        match (self, family) {
            (Self::Int8, _) => QuantFormat::Int8,
            (Self::Fp8, HardwareFamily::Cuda) => QuantFormat::Fp8E4m3Fn,
            (Self::Fp8, HardwareFamily::Rocm) => QuantFormat::Fp8E4m3Fnuz,
        }
    }
}

impl FromStr for InputFormat {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp8" => Ok(Self::Fp8),
            "int8" => Ok(Self::Int8),
            other => Err(TuneError::InvalidConfig(format!("unknown input type `{other}`"))),
        }
    }
}

/// Concrete narrow storage format of the quantized operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantFormat {
    Fp8E4m3Fn,
    Fp8E4m3Fnuz,
    Int8,
}

impl QuantFormat {
    /// Largest finite magnitude representable in the format.
    pub fn max_value(&self) -> f32 {
        match self {
            Self::Fp8E4m3Fn => 448.0,
            Self::Fp8E4m3Fnuz => 240.0,
            Self::Int8 => i8::MAX as f32,
        }
    }

    /// Smallest (most negative) finite value.
    pub fn min_value(&self) -> f32 {
        match self {
            Self::Fp8E4m3Fn => -448.0,
            Self::Fp8E4m3Fnuz => -240.0,
            Self::Int8 => i8::MIN as f32,
        }
    }
}

/// Output dtype of the matmul.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputDtype {
    Float32,
    #[default]
    Float16,
    Bfloat16,
    Half,
}

impl OutputDtype {
    pub fn elem_bytes(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 | Self::Bfloat16 | Self::Half => 2,
        }
    }
}

impl FromStr for OutputDtype {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" => Ok(Self::Float32),
            "float16" => Ok(Self::Float16),
            "bfloat16" => Ok(Self::Bfloat16),
            "half" => Ok(Self::Half),
            other => Err(TuneError::InvalidConfig(format!("unknown output dtype `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(7168, 128), 56);
        assert_eq!(ceil_div(576, 128), 5);
        assert_eq!(ceil_div(1, 128), 1);
        assert_eq!(ceil_div(128, 128), 1);
    }

    #[test]
    fn test_fp8_resolves_per_family() {
        assert_eq!(InputFormat::Fp8.resolve(HardwareFamily::Cuda), QuantFormat::Fp8E4m3Fn);
        assert_eq!(InputFormat::Fp8.resolve(HardwareFamily::Rocm), QuantFormat::Fp8E4m3Fnuz);
        assert_eq!(InputFormat::Int8.resolve(HardwareFamily::Rocm), QuantFormat::Int8);
    }

    #[test]
    fn test_parse_selectors() {
        assert_eq!("INT8".parse::<InputFormat>().unwrap(), InputFormat::Int8);
        assert_eq!("bfloat16".parse::<OutputDtype>().unwrap(), OutputDtype::Bfloat16);
        assert!("fp4".parse::<InputFormat>().is_err());
        assert!("float64".parse::<OutputDtype>().is_err());
    }

    #[test]
    fn test_block_size_display() {
        assert_eq!(BlockSize::new(128, 64).to_string(), "[128, 64]");
    }
}
