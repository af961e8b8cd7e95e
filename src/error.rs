//! Error taxonomy for the tuner.
//!
//! Kernel-level rejections are a separate type so the benchmark harness can
//! swallow them without pattern-matching on the fatal variants.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TuneError {
    #[error("no compute devices available for tuning")]
    NoDevices,
    #[error(
        "no viable kernel config for N={n} K={k} batch_size={batch_size} ({rejected} candidates rejected)"
    )]
    NoViableConfig {
        n: usize,
        k: usize,
        batch_size: usize,
        rejected: usize,
    },
    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt tuning table at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("device error: {0}")]
    Device(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("kernel failure: {0}")]
    Kernel(String),
    #[error("{} tuning worker(s) failed: {}", failures.len(), failures.join("; "))]
    WorkerFailed { failures: Vec<String> },
}

pub type TuneResult<T> = Result<T, TuneError>;

impl TuneError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TuneError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Outcome of a failed kernel launch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// The device or runtime refused the config (shared memory, registers).
    #[error("config rejected: {0}")]
    Rejected(String),
    #[error("kernel fault: {0}")]
    Fatal(String),
}

impl From<KernelError> for TuneError {
    fn from(err: KernelError) -> Self {
        TuneError::Kernel(err.to_string())
    }
}

#[cfg(feature = "cuda")]
impl From<cudarc::driver::DriverError> for TuneError {
    fn from(err: cudarc::driver::DriverError) -> Self {
        TuneError::Device(format!("{err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_viable_config_display() {
        let err = TuneError::NoViableConfig {
            n: 4096,
            k: 7168,
            batch_size: 64,
            rejected: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("N=4096"));
        assert!(msg.contains("batch_size=64"));
        assert!(msg.contains("3 candidates rejected"));
    }

    #[test]
    fn test_worker_failed_display() {
        let err = TuneError::WorkerFailed {
            failures: vec!["device 1: boom".into(), "device 3: disk full".into()],
        };
        assert_eq!(
            err.to_string(),
            "2 tuning worker(s) failed: device 1: boom; device 3: disk full"
        );
    }

    #[test]
    fn test_kernel_error_converts_to_fatal() {
        let err: TuneError = KernelError::Fatal("illegal address".into()).into();
        assert!(matches!(err, TuneError::Kernel(_)));
    }
}
