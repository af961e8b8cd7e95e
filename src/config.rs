//! Run configuration.
//!
//! Layered lowest to highest precedence: built-in defaults, an optional
//! JSON file, `GLLM_TUNE_*` environment variables, then command-line flags
//! (applied by the binary).
//!
//! | Variable | Field |
//! |---|---|
//! | `GLLM_TUNE_TP_SIZE` | `tp_size` |
//! | `GLLM_TUNE_INPUT_TYPE` | `input_type` (`fp8`, `int8`) |
//! | `GLLM_TUNE_OUT_DTYPE` | `out_dtype` |
//! | `GLLM_TUNE_BLOCK_N` / `GLLM_TUNE_BLOCK_K` | `block_n` / `block_k` |
//! | `GLLM_TUNE_BATCH_SIZE` | `batch_size` |
//! | `GLLM_TUNE_SAVE_PATH` | `save_path` |
//! | `GLLM_TUNE_WARMUP_ITERS` / `GLLM_TUNE_ITERS` | `bench.*` |
//! | `GLLM_TUNE_LATENCY_DIVISOR` | `bench.latency_divisor` |
//! | `GLLM_TUNE_DEVICES` | `host.devices` |
//! | `GLLM_TUNE_THREADS_PER_DEVICE` | `host.threads_per_device` |
//! | `GLLM_TUNE_FAMILY` | `host.family` (`cuda`, `rocm`) |
//! | `GLLM_TUNE_DEVICE_NAME` | `host.device_name` |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::autotuning::distribute::TuneRequest;
use crate::autotuning::measure::BenchConfig;
use crate::error::{TuneError, TuneResult};
use crate::types::{BlockSize, HardwareFamily, InputFormat, OutputDtype, WeightShape};
use crate::weights::{deepseek_v3_weight_shapes, DEFAULT_BATCH_SIZES};

pub const DEFAULT_SAVE_PATH: &str = "python/sglang/srt/layers/quantization/configs";

/// Host runtime knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Logical devices; `None` means one
    pub devices: Option<usize>,
    /// Threads per logical device; `None` splits all cores evenly
    pub threads_per_device: Option<usize>,
    /// Family the host devices pretend to be
    pub family: HardwareFamily,
    /// Overrides the detected CPU model name in table file names
    pub device_name: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            devices: None,
            threads_per_device: None,
            family: HardwareFamily::Cuda,
            device_name: None,
        }
    }
}

/// Everything one tuning run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Tensor-parallel degree used to partition the weight shapes
    pub tp_size: usize,
    pub input_type: InputFormat,
    pub out_dtype: OutputDtype,
    pub block_n: usize,
    pub block_k: usize,
    /// Tune only this batch size (on one device)
    pub batch_size: Option<usize>,
    /// Replaces the default batch-size sweep
    pub batch_sizes: Option<Vec<usize>>,
    /// Replaces the DeepSeek-V3 shape table
    pub weight_shapes: Option<Vec<WeightShape>>,
    pub save_path: PathBuf,
    pub bench: BenchConfig,
    pub host: HostConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        TunerConfig {
            tp_size: 8,
            input_type: InputFormat::Fp8,
            out_dtype: OutputDtype::Float16,
            block_n: 128,
            block_k: 128,
            batch_size: None,
            batch_sizes: None,
            weight_shapes: None,
            save_path: PathBuf::from(DEFAULT_SAVE_PATH),
            bench: BenchConfig::default(),
            host: HostConfig::default(),
        }
    }
}

impl TunerConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> TuneResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| TuneError::storage(path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| TuneError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `GLLM_TUNE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> TuneResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> TuneResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("GLLM_TUNE_TP_SIZE") {
            self.tp_size = parse_env("GLLM_TUNE_TP_SIZE", &v)?;
        }
        if let Some(v) = var("GLLM_TUNE_INPUT_TYPE") {
            self.input_type = v.parse()?;
        }
        if let Some(v) = var("GLLM_TUNE_OUT_DTYPE") {
            self.out_dtype = v.parse()?;
        }
        if let Some(v) = var("GLLM_TUNE_BLOCK_N") {
            self.block_n = parse_env("GLLM_TUNE_BLOCK_N", &v)?;
        }
        if let Some(v) = var("GLLM_TUNE_BLOCK_K") {
            self.block_k = parse_env("GLLM_TUNE_BLOCK_K", &v)?;
        }
        if let Some(v) = var("GLLM_TUNE_BATCH_SIZE") {
            self.batch_size = Some(parse_env("GLLM_TUNE_BATCH_SIZE", &v)?);
        }
        if let Some(v) = var("GLLM_TUNE_SAVE_PATH") {
            self.save_path = PathBuf::from(v);
        }
        if let Some(v) = var("GLLM_TUNE_WARMUP_ITERS") {
            self.bench.warmup_iters = parse_env("GLLM_TUNE_WARMUP_ITERS", &v)?;
        }
        if let Some(v) = var("GLLM_TUNE_ITERS") {
            self.bench.iters = parse_env("GLLM_TUNE_ITERS", &v)?;
        }
        if let Some(v) = var("GLLM_TUNE_LATENCY_DIVISOR") {
            self.bench.latency_divisor = parse_env("GLLM_TUNE_LATENCY_DIVISOR", &v)?;
        }
        if let Some(v) = var("GLLM_TUNE_DEVICES") {
            self.host.devices = Some(parse_env("GLLM_TUNE_DEVICES", &v)?);
        }
        if let Some(v) = var("GLLM_TUNE_THREADS_PER_DEVICE") {
            self.host.threads_per_device = Some(parse_env("GLLM_TUNE_THREADS_PER_DEVICE", &v)?);
        }
        if let Some(v) = var("GLLM_TUNE_FAMILY") {
            self.host.family = parse_family(&v)?;
        }
        if let Some(v) = var("GLLM_TUNE_DEVICE_NAME") {
            self.host.device_name = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.tp_size == 0 {
            return Err(TuneError::InvalidConfig("tp_size must be at least 1".into()));
        }
        if self.block_n == 0 || self.block_k == 0 {
            return Err(TuneError::InvalidConfig(format!(
                "block shape must be positive, got [{}, {}]",
                self.block_n, self.block_k
            )));
        }
        if self.batch_size == Some(0) || self.batch_sizes.as_ref().is_some_and(|b| b.is_empty() || b.contains(&0)) {
            return Err(TuneError::InvalidConfig("batch sizes must be positive".into()));
        }
        if let Some(shapes) = &self.weight_shapes {
            if shapes.iter().any(|s| s.n == 0 || s.k == 0) {
                return Err(TuneError::InvalidConfig("weight shapes must be positive".into()));
            }
        }
        if self.host.devices == Some(0) {
            return Err(TuneError::InvalidConfig("host.devices must be at least 1".into()));
        }
        self.bench.validate()
    }

    pub fn block(&self) -> BlockSize {
        BlockSize::new(self.block_n, self.block_k)
    }

    /// Batch sizes to tune, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        match (self.batch_size, &self.batch_sizes) {
            (Some(m), _) => vec![m],
            (None, Some(list)) => list.clone(),
            (None, None) => DEFAULT_BATCH_SIZES.to_vec(),
        }
    }

    /// Weight shapes to tune, in order.
    pub fn weight_shapes(&self) -> Vec<WeightShape> {
        self.weight_shapes
            .clone()
            .unwrap_or_else(|| deepseek_v3_weight_shapes(self.tp_size))
    }

    pub fn tune_request(&self) -> TuneRequest {
        TuneRequest {
            input_type: self.input_type,
            out_dtype: self.out_dtype,
            block: self.block(),
            bench: self.bench.clone(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> TuneResult<T> {
    value
        .parse()
        .map_err(|_| TuneError::InvalidConfig(format!("{key}: cannot parse `{value}`")))
}

fn parse_family(value: &str) -> TuneResult<HardwareFamily> {
    match value.to_ascii_lowercase().as_str() {
        "cuda" => Ok(HardwareFamily::Cuda),
        "rocm" | "hip" => Ok(HardwareFamily::Rocm),
        other => Err(TuneError::InvalidConfig(format!("unknown hardware family `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = TunerConfig::default();
        assert_eq!(cfg.tp_size, 8);
        assert_eq!(cfg.block(), BlockSize::new(128, 128));
        assert_eq!(cfg.batch_sizes(), DEFAULT_BATCH_SIZES);
        assert_eq!(cfg.weight_shapes().len(), 13);
        assert_eq!(cfg.save_path, PathBuf::from(DEFAULT_SAVE_PATH));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_single_batch_size_wins() {
        let cfg = TunerConfig {
            batch_size: Some(64),
            batch_sizes: Some(vec![1, 2]),
            ..TunerConfig::default()
        };
        assert_eq!(cfg.batch_sizes(), vec![64]);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tune.json");
        std::fs::write(
            &path,
            r#"{"tp_size": 4, "input_type": "int8", "bench": {"iters": 3}, "host": {"family": "rocm"}}"#,
        )
        .unwrap();
        let cfg = TunerConfig::from_file(&path).unwrap();
        assert_eq!(cfg.tp_size, 4);
        assert_eq!(cfg.input_type, InputFormat::Int8);
        assert_eq!(cfg.bench.iters, 3);
        assert_eq!(cfg.bench.warmup_iters, 5);
        assert_eq!(cfg.host.family, HardwareFamily::Rocm);
        assert_eq!(cfg.block_k, 128);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("GLLM_TUNE_TP_SIZE", "16"),
            ("GLLM_TUNE_OUT_DTYPE", "bfloat16"),
            ("GLLM_TUNE_BATCH_SIZE", " 32 "),
            ("GLLM_TUNE_FAMILY", "ROCm"),
            ("GLLM_TUNE_LATENCY_DIVISOR", "1"),
            ("GLLM_TUNE_SAVE_PATH", ""),
        ]);
        let mut cfg = TunerConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.tp_size, 16);
        assert_eq!(cfg.out_dtype, OutputDtype::Bfloat16);
        assert_eq!(cfg.batch_size, Some(32));
        assert_eq!(cfg.host.family, HardwareFamily::Rocm);
        assert_eq!(cfg.bench.latency_divisor, 1.0);
        // empty values are ignored
        assert_eq!(cfg.save_path, PathBuf::from(DEFAULT_SAVE_PATH));
    }

    #[test]
    fn test_bad_env_value() {
        let mut cfg = TunerConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "GLLM_TUNE_BLOCK_K").then(|| "wide".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("GLLM_TUNE_BLOCK_K"));
    }

    #[test]
    fn test_validation() {
        let bad = [
            TunerConfig {
                tp_size: 0,
                ..TunerConfig::default()
            },
            TunerConfig {
                block_k: 0,
                ..TunerConfig::default()
            },
            TunerConfig {
                batch_sizes: Some(vec![]),
                ..TunerConfig::default()
            },
            TunerConfig {
                batch_size: Some(0),
                ..TunerConfig::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(TuneError::InvalidConfig(_))), "{cfg:?}");
        }
    }
}
