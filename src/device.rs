//! Device runtime seam.
//!
//! The tuner only needs four things from a compute runtime: enumerate
//! devices, bind an execution context to one of them, wait for all
//! outstanding work, and bracket a region of work with a device timer.
//! A bound device is owned by exactly one worker for its whole lifetime.

use crate::error::TuneResult;
use crate::types::HardwareFamily;

/// An execution context bound to one physical (or logical) device.
pub trait ComputeDevice {
    /// Opaque timer token returned by [`ComputeDevice::start_timer`].
    type Timer;

    /// Index this context was bound with.
    fn ordinal(&self) -> usize;

    /// Marketing name; used (with spaces replaced) in table file names.
    fn name(&self) -> &str;

    fn family(&self) -> HardwareFamily;

    /// Number of compute units (SMs / CUs).
    fn compute_units(&self) -> usize;

    /// Block until all work queued on the device has completed.
    fn synchronize(&self) -> TuneResult<()>;

    /// Mark the start of a timed region.
    fn start_timer(&self) -> TuneResult<Self::Timer>;

    /// Mark the end of a timed region, wait for it, and return elapsed ms.
    fn stop_timer(&self, timer: Self::Timer) -> TuneResult<f64>;
}

/// Factory for device contexts.
pub trait DeviceRuntime: Sync {
    type Device: ComputeDevice;

    /// Number of devices available to this process.
    fn device_count(&self) -> TuneResult<usize>;

    /// Bind a new execution context to device `ordinal`.
    fn bind(&self, ordinal: usize) -> TuneResult<Self::Device>;
}

/// Device name normalized for use in a file name.
pub fn normalized_device_name(name: &str) -> String {
    name.replace(' ', "_")
}
