//! Host runtime: CPU cores partitioned into logical tuning devices.
//!
//! Each logical device owns a private rayon pool, so kernels launched by
//! one worker never borrow threads from another. Launches are synchronous,
//! which makes `synchronize` a no-op and wall-clock timing exact.

use std::time::Instant;

use crate::device::{ComputeDevice, DeviceRuntime};
use crate::error::{TuneError, TuneResult};
use crate::types::HardwareFamily;

/// Resource budget a launch config is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Shared memory (LDS) per workgroup, bytes
    pub shared_mem_bytes: usize,
    /// Registers available to one thread
    pub max_regs_per_thread: usize,
    /// Threads per warp / wavefront
    pub warp_size: usize,
}

impl DeviceLimits {
    /// Budgets of a representative part of each family.
    pub fn for_family(family: HardwareFamily) -> Self {
        match family {
            // H100: 227 KiB opt-in shared memory, 255 regs
            HardwareFamily::Cuda => DeviceLimits {
                shared_mem_bytes: 227 * 1024,
                max_regs_per_thread: 255,
                warp_size: 32,
            },
            // MI300X: 64 KiB LDS, 512 VGPRs, wave64
            HardwareFamily::Rocm => DeviceLimits {
                shared_mem_bytes: 64 * 1024,
                max_regs_per_thread: 512,
                warp_size: 64,
            },
        }
    }
}

/// Runtime handing out [`CpuDevice`]s.
#[derive(Debug, Clone)]
pub struct CpuRuntime {
    devices: usize,
    threads_per_device: usize,
    family: HardwareFamily,
    limits: DeviceLimits,
    name: String,
}

impl CpuRuntime {
    pub fn new(devices: usize, threads_per_device: usize, family: HardwareFamily) -> Self {
        CpuRuntime {
            devices,
            threads_per_device: threads_per_device.max(1),
            family,
            limits: DeviceLimits::for_family(family),
            name: detect_cpu_model(),
        }
    }

    /// Split all logical cores evenly across `devices` logical devices.
    pub fn partitioned(devices: usize, family: HardwareFamily) -> Self {
        let logical = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(devices, logical / devices.max(1), family)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn family(&self) -> HardwareFamily {
        self.family
    }
}

impl DeviceRuntime for CpuRuntime {
    type Device = CpuDevice;

    fn device_count(&self) -> TuneResult<usize> {
        Ok(self.devices)
    }

    fn bind(&self, ordinal: usize) -> TuneResult<CpuDevice> {
        if ordinal >= self.devices {
            return Err(TuneError::Device(format!(
                "host device {ordinal} out of range (have {})",
                self.devices
            )));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads_per_device)
            .thread_name(move |i| format!("tune-dev{ordinal}-{i}"))
            .build()
            .map_err(|e| TuneError::Device(format!("host device {ordinal}: {e}")))?;
        log::debug!(
            "bound host device {ordinal} ({} threads, {:?} limits)",
            self.threads_per_device,
            self.family
        );
        Ok(CpuDevice {
            ordinal,
            name: self.name.clone(),
            family: self.family,
            limits: self.limits,
            pool,
        })
    }
}

/// One logical host device.
#[derive(Debug)]
pub struct CpuDevice {
    ordinal: usize,
    name: String,
    family: HardwareFamily,
    limits: DeviceLimits,
    pool: rayon::ThreadPool,
}

impl CpuDevice {
    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    /// Run `op` on this device's private thread pool.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl ComputeDevice for CpuDevice {
    type Timer = Instant;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> HardwareFamily {
        self.family
    }

    fn compute_units(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn synchronize(&self) -> TuneResult<()> {
        Ok(())
    }

    fn start_timer(&self) -> TuneResult<Instant> {
        Ok(Instant::now())
    }

    fn stop_timer(&self, timer: Instant) -> TuneResult<f64> {
        Ok(timer.elapsed().as_secs_f64() * 1e3)
    }
}

// ── CPU identity detection ──────────────────────────────────────────────

fn detect_cpu_model() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Some(model) = linux_cpuinfo_model() {
            return model;
        }
    }
    "Host CPU".to_string()
}

#[cfg(target_os = "linux")]
fn linux_cpuinfo_model() -> Option<String> {
    let content = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    content
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split(':').nth(1))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_in_range() {
        let rt = CpuRuntime::new(2, 1, HardwareFamily::Cuda).with_name("Test Host");
        assert_eq!(rt.device_count().unwrap(), 2);
        let dev = rt.bind(1).unwrap();
        assert_eq!(dev.ordinal(), 1);
        assert_eq!(dev.name(), "Test Host");
        assert_eq!(dev.compute_units(), 1);
        assert_eq!(dev.limits().warp_size, 32);
    }

    #[test]
    fn test_bind_out_of_range() {
        let rt = CpuRuntime::new(1, 1, HardwareFamily::Rocm);
        assert!(matches!(rt.bind(1), Err(TuneError::Device(_))));
    }

    #[test]
    fn test_timer_is_monotonic() {
        let rt = CpuRuntime::new(1, 1, HardwareFamily::Cuda);
        let dev = rt.bind(0).unwrap();
        let t = dev.start_timer().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let ms = dev.stop_timer(t).unwrap();
        assert!(ms >= 2.0, "elapsed {ms}ms");
    }

    #[test]
    fn test_partitioned_gives_each_device_a_thread() {
        let rt = CpuRuntime::partitioned(64, HardwareFamily::Cuda);
        let dev = rt.bind(0).unwrap();
        assert!(dev.compute_units() >= 1);
    }
}
