//! CUDA device runtime over cudarc.
//!
//! One [`CudaContext`] per bound ordinal; timing uses events recorded on the
//! context's default stream. Kernels for this runtime implement
//! [`BlockMatmul<CudaDevice>`](crate::traits::BlockMatmul) and launch on
//! [`CudaDevice::stream`].

use std::sync::Arc;

use cudarc::driver::sys::{CUdevice_attribute, CUevent_flags};
use cudarc::driver::{CudaContext, CudaEvent, CudaStream};

use crate::device::{ComputeDevice, DeviceRuntime};
use crate::error::{TuneError, TuneResult};
use crate::types::HardwareFamily;

/// Enumerates CUDA devices through the driver API.
#[derive(Debug, Clone, Copy, Default)]
pub struct CudaRuntime;

impl CudaRuntime {
    pub fn new() -> Self {
        CudaRuntime
    }
}

impl DeviceRuntime for CudaRuntime {
    type Device = CudaDevice;

    fn device_count(&self) -> TuneResult<usize> {
        match CudaContext::device_count() {
            Ok(n) => Ok(n.max(0) as usize),
            Err(e) => {
                log::debug!("CUDA not available: {e}");
                Ok(0)
            }
        }
    }

    fn bind(&self, ordinal: usize) -> TuneResult<CudaDevice> {
        let ctx = CudaContext::new(ordinal)?;
        ctx.bind_to_thread()?;
        let name = ctx.name()?;
        let sms = ctx.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let stream = ctx.default_stream();
        log::info!("bound CUDA device {ordinal}: {name} ({sms} SMs)");
        Ok(CudaDevice {
            ordinal,
            name,
            compute_units: sms.max(1) as usize,
            ctx,
            stream,
        })
    }
}

/// A CUDA context bound to one GPU.
pub struct CudaDevice {
    ordinal: usize,
    name: String,
    compute_units: usize,
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaDevice {
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    /// Stream kernels must launch on for timing to cover them.
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

impl ComputeDevice for CudaDevice {
    type Timer = CudaEvent;

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> HardwareFamily {
        HardwareFamily::Cuda
    }

    fn compute_units(&self) -> usize {
        self.compute_units
    }

    fn synchronize(&self) -> TuneResult<()> {
        self.ctx.synchronize()?;
        Ok(())
    }

    fn start_timer(&self) -> TuneResult<CudaEvent> {
        Ok(self.stream.record_event(Some(CUevent_flags::CU_EVENT_DEFAULT))?)
    }

    fn stop_timer(&self, start: CudaEvent) -> TuneResult<f64> {
        let end = self.stream.record_event(Some(CUevent_flags::CU_EVENT_DEFAULT))?;
        end.synchronize()?;
        let ms = start
            .elapsed_ms(&end)
            .map_err(|e| TuneError::Device(format!("event timing on device {}: {e:?}", self.ordinal)))?;
        Ok(ms as f64)
    }
}
