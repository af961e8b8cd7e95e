//! Tuning tables and their on-disk store.
//!
//! One JSON file per (shape, device, input type, quantization block). The
//! file is an object keyed by batch size (as a decimal string) whose values
//! are launch configs. Saving always merges with what is already on disk,
//! so runs that tuned different batch sizes enrich the same file instead of
//! overwriting each other.
//!
//! ```text
//! N=4096,K=7168,device_name=NVIDIA_H100_80GB_HBM3,dtype=fp8_w8a8,block_shape=[128, 128].json
//! {
//!     "1": { "BLOCK_SIZE_M": 16, ... },
//!     "64": { ... }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::autotuning::lock::StoreLock;
use crate::autotuning::search_space::KernelConfig;
use crate::device::normalized_device_name;
use crate::error::{TuneError, TuneResult};
use crate::types::{BlockSize, InputFormat, WeightShape};

/// Batch size -> best launch config, iterated in ascending batch size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TuningTable {
    entries: BTreeMap<usize, KernelConfig>,
}

impl TuningTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, batch_size: usize, config: KernelConfig) -> Option<KernelConfig> {
        self.entries.insert(batch_size, config)
    }

    pub fn get(&self, batch_size: usize) -> Option<&KernelConfig> {
        self.entries.get(&batch_size)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &KernelConfig)> {
        self.entries.iter()
    }

    /// Overlay `newer` onto this table; entries in `newer` win.
    pub fn merge(&mut self, newer: &TuningTable) {
        for (&m, cfg) in &newer.entries {
            self.entries.insert(m, cfg.clone());
        }
    }

    /// Config tuned for the nearest batch size (ties go to the smaller one).
    pub fn lookup(&self, batch_size: usize) -> Option<&KernelConfig> {
        self.entries
            .iter()
            .min_by_key(|&(&m, _)| (m.abs_diff(batch_size), m))
            .map(|(_, cfg)| cfg)
    }

    /// Pretty JSON with a four-space indent and a trailing newline.
    pub fn to_json_bytes(&self) -> TuneResult<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)
            .map_err(|e| TuneError::InvalidConfig(format!("failed to serialize tuning table: {e}")))?;
        buf.push(b'\n');
        Ok(buf)
    }
}

impl FromIterator<(usize, KernelConfig)> for TuningTable {
    fn from_iter<I: IntoIterator<Item = (usize, KernelConfig)>>(iter: I) -> Self {
        TuningTable {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Everything that selects one table file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub shape: WeightShape,
    /// Raw device name; spaces are replaced when the file name is built
    pub device_name: String,
    pub input_type: InputFormat,
    pub block: BlockSize,
}

impl TableKey {
    pub fn new(shape: WeightShape, device_name: &str, input_type: InputFormat, block: BlockSize) -> Self {
        TableKey {
            shape,
            device_name: device_name.to_string(),
            input_type,
            block,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "N={},K={},device_name={},dtype={}_w8a8,block_shape={}.json",
            self.shape.n,
            self.shape.k,
            normalized_device_name(&self.device_name),
            self.input_type.name(),
            self.block,
        )
    }
}

/// Directory of tuning tables.
#[derive(Debug, Clone)]
pub struct ResultStore {
    save_path: PathBuf,
}

impl ResultStore {
    pub fn new(save_path: impl Into<PathBuf>) -> Self {
        ResultStore {
            save_path: save_path.into(),
        }
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn table_path(&self, key: &TableKey) -> PathBuf {
        self.save_path.join(key.file_name())
    }

    /// Read a table; `None` when the file does not exist.
    pub fn load(&self, key: &TableKey) -> TuneResult<Option<TuningTable>> {
        read_table(&self.table_path(key))
    }

    /// Merge `table` into the stored table for `key` and write it back.
    ///
    /// Runs entirely inside the store lock, so concurrent savers targeting
    /// the same file never lose each other's entries. Returns the path
    /// written.
    pub fn merge_and_save(&self, key: &TableKey, table: &TuningTable) -> TuneResult<PathBuf> {
        fs::create_dir_all(&self.save_path).map_err(|e| TuneError::storage(&self.save_path, e))?;
        let _lock = StoreLock::acquire(&self.save_path)?;

        let path = self.table_path(key);
        let mut merged = read_table(&path)?.unwrap_or_default();
        let prior = merged.len();
        merged.merge(table);
        write_atomic(&path, &merged.to_json_bytes()?)?;

        log::info!(
            "wrote {} ({} entries: {} from this run, {} previously on disk)",
            path.display(),
            merged.len(),
            table.len(),
            prior,
        );
        Ok(path)
    }
}

fn read_table(path: &Path) -> TuneResult<Option<TuningTable>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(TuneError::storage(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| TuneError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Write to a sibling temp file, flush it to disk, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> TuneResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp.{}", std::process::id()));
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(TuneError::storage(path, e));
    }
    Ok(())
}
