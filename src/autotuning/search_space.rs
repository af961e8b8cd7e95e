//! Kernel launch-config search space.
//!
//! Two enumeration policies exist, one per hardware family. The policy is
//! chosen once from the family tag of the bound device; everything after
//! that works on the flat candidate list.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::HardwareFamily;

/// A concrete launch configuration for the block-scaled matmul kernel.
///
/// Serialized field names and order match the persisted table format.
/// Parameters this crate does not know about (written by other tools) are
/// kept in `extra` so a merge never drops them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(rename = "BLOCK_SIZE_M")]
    pub block_size_m: usize,
    #[serde(rename = "BLOCK_SIZE_N")]
    pub block_size_n: usize,
    #[serde(rename = "BLOCK_SIZE_K")]
    pub block_size_k: usize,
    #[serde(rename = "GROUP_SIZE_M")]
    pub group_size_m: usize,
    pub num_warps: usize,
    pub num_stages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waves_per_eu: Option<usize>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, i64>,
}

impl KernelConfig {
    pub fn new(
        block_size_m: usize,
        block_size_n: usize,
        block_size_k: usize,
        group_size_m: usize,
        num_warps: usize,
        num_stages: usize,
    ) -> Self {
        Self {
            block_size_m,
            block_size_n,
            block_size_k,
            group_size_m,
            num_warps,
            num_stages,
            waves_per_eu: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_waves_per_eu(mut self, waves: usize) -> Self {
        self.waves_per_eu = Some(waves);
        self
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BM={} BN={} BK={} GM={} warps={} stages={}",
            self.block_size_m,
            self.block_size_n,
            self.block_size_k,
            self.group_size_m,
            self.num_warps,
            self.num_stages,
        )?;
        if let Some(w) = self.waves_per_eu {
            write!(f, " waves_per_eu={w}")?;
        }
        Ok(())
    }
}

/// A tunable parameter and the discrete values it takes.
#[derive(Debug, Clone)]
pub struct ParamValues {
    pub name: &'static str,
    pub values: Vec<usize>,
}

impl ParamValues {
    fn new(name: &'static str, values: &[usize]) -> Self {
        Self {
            name,
            values: values.to_vec(),
        }
    }

    /// Number of discrete values.
    pub fn count(&self) -> usize {
        self.values.len()
    }
}

/// Search space for one hardware family.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    pub family: HardwareFamily,
    pub num_stages: ParamValues,
    pub block_m: ParamValues,
    pub block_k: ParamValues,
    pub block_n: ParamValues,
    pub num_warps: ParamValues,
    pub group_size_m: ParamValues,
    /// Occupancy hint, fixed per family when present.
    pub waves_per_eu: Option<usize>,
}

impl SearchSpace {
    /// Select the enumeration policy for a hardware family.
    pub fn for_family(family: HardwareFamily) -> Self {
        match family {
            HardwareFamily::Rocm => Self::wide_cu(),
            HardwareFamily::Cuda => Self::deep_pipeline(),
        }
    }

    /// Wide-CU policy: one pipeline stage count, wider tile range, wave hint.
    fn wide_cu() -> Self {
        SearchSpace {
            family: HardwareFamily::Rocm,
            num_stages: ParamValues::new("num_stages", &[2]),
            block_m: ParamValues::new("BLOCK_SIZE_M", &[32, 64, 128, 256]),
            block_k: ParamValues::new("BLOCK_SIZE_K", &[32, 64, 128, 256]),
            block_n: ParamValues::new("BLOCK_SIZE_N", &[16, 32, 64, 128, 256]),
            num_warps: ParamValues::new("num_warps", &[4, 8]),
            group_size_m: ParamValues::new("GROUP_SIZE_M", &[1, 4, 8, 16, 32]),
            waves_per_eu: Some(0),
        }
    }

    /// Deep-pipeline policy: stage counts 2..=5.
    fn deep_pipeline() -> Self {
        SearchSpace {
            family: HardwareFamily::Cuda,
            num_stages: ParamValues::new("num_stages", &[2, 3, 4, 5]),
            block_m: ParamValues::new("BLOCK_SIZE_M", &[16, 32, 64, 128, 256]),
            block_k: ParamValues::new("BLOCK_SIZE_K", &[64, 128]),
            block_n: ParamValues::new("BLOCK_SIZE_N", &[32, 64, 128, 256]),
            num_warps: ParamValues::new("num_warps", &[4, 8]),
            group_size_m: ParamValues::new("GROUP_SIZE_M", &[1, 16, 32, 64]),
            waves_per_eu: None,
        }
    }

    /// Total number of configurations in the full grid.
    pub fn grid_size(&self) -> usize {
        self.num_stages.count()
            * self.block_m.count()
            * self.block_k.count()
            * self.block_n.count()
            * self.num_warps.count()
            * self.group_size_m.count()
    }

    /// Enumerate the full cross product.
    ///
    /// Nesting order (outer to inner): stages, M, K, N, warps, group.
    pub fn enumerate(&self) -> Vec<KernelConfig> {
        let mut configs = Vec::with_capacity(self.grid_size());
        for &stages in &self.num_stages.values {
            for &bm in &self.block_m.values {
                for &bk in &self.block_k.values {
                    for &bn in &self.block_n.values {
                        for &warps in &self.num_warps.values {
                            for &group in &self.group_size_m.values {
                                let mut cfg = KernelConfig::new(bm, bn, bk, group, warps, stages);
                                cfg.waves_per_eu = self.waves_per_eu;
                                configs.push(cfg);
                            }
                        }
                    }
                }
            }
        }
        configs
    }

    /// Enumerate and keep only configs whose K tile divides `block_k`.
    pub fn candidates_for_block_k(&self, block_k: usize) -> Vec<KernelConfig> {
        filter_divides_block_k(self.enumerate(), block_k)
    }
}

/// Drop configs whose K tile cannot tile the scale tensor along K.
pub fn filter_divides_block_k(configs: Vec<KernelConfig>, block_k: usize) -> Vec<KernelConfig> {
    configs
        .into_iter()
        .filter(|cfg| cfg.block_size_k != 0 && block_k % cfg.block_size_k == 0)
        .collect()
}
