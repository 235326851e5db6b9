//! Local accelerator selection.

use candle_core::Device;

use super::env::{LaunchEnv, CUDA_VISIBLE_DEVICES};
use super::error::{DistributedError, Result};

/// Source of compute devices for this process.
pub trait DeviceSelector: Send + Sync {
    /// Whether an accelerator is present at all.
    fn is_available(&self) -> bool;

    /// Number of accelerators visible to this process, when known.
    fn device_count(&self) -> Option<usize> {
        None
    }

    /// Open the accelerator with the given ordinal.
    fn select(&self, ordinal: usize) -> std::result::Result<Device, String>;
}

/// Devices as candle sees them.
#[derive(Debug, Clone, Copy, Default)]
pub struct CandleDeviceSelector;

impl DeviceSelector for CandleDeviceSelector {
    fn is_available(&self) -> bool {
        candle_core::utils::cuda_is_available()
    }

    #[cfg(feature = "cuda")]
    fn device_count(&self) -> Option<usize> {
        candle_core::cuda::cudarc::driver::CudaContext::device_count()
            .ok()
            .and_then(|n| usize::try_from(n).ok())
    }

    fn select(&self, ordinal: usize) -> std::result::Result<Device, String> {
        Device::new_cuda(ordinal).map_err(|e| e.to_string())
    }
}

/// Pick the device for `local_rank`.
///
/// Falls back to the CPU when no accelerator is available. A failed
/// selection is logged together with `CUDA_VISIBLE_DEVICES` and returned.
pub fn select_local_device(
    selector: &dyn DeviceSelector,
    local_rank: usize,
    env: &LaunchEnv,
) -> Result<Device> {
    if !selector.is_available() {
        tracing::debug!(local_rank, "no accelerator available, using CPU");
        return Ok(Device::Cpu);
    }

    selector.select(local_rank).map_err(|reason| {
        let visible_devices = env.get(CUDA_VISIBLE_DEVICES).map(str::to_string);
        tracing::error!(
            local_rank,
            device_count = ?selector.device_count(),
            cuda_visible_devices = visible_devices.as_deref().unwrap_or("<unset>"),
            error = %reason,
            "failed to select local device"
        );
        DistributedError::DeviceSelection {
            ordinal: local_rank,
            visible_devices,
            reason,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeGpus {
        count: usize,
    }

    impl DeviceSelector for FakeGpus {
        fn is_available(&self) -> bool {
            self.count > 0
        }

        fn device_count(&self) -> Option<usize> {
            Some(self.count)
        }

        fn select(&self, ordinal: usize) -> std::result::Result<Device, String> {
            if ordinal < self.count {
                Ok(Device::Cpu)
            } else {
                Err(format!("invalid device ordinal {ordinal}"))
            }
        }
    }

    #[test]
    fn cpu_when_no_accelerator() {
        let device = select_local_device(&FakeGpus { count: 0 }, 3, &LaunchEnv::default()).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn selects_visible_ordinal() {
        let device = select_local_device(&FakeGpus { count: 2 }, 1, &LaunchEnv::default()).unwrap();
        assert!(device.is_cpu());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn candle_selector_without_cuda_has_no_devices() {
        let selector = CandleDeviceSelector;
        assert!(!selector.is_available());
        assert_eq!(selector.device_count(), None);
    }

    #[cfg(feature = "cuda")]
    #[test]
    #[ignore = "Requires CUDA"]
    fn candle_selector_counts_cuda_devices() {
        let selector = CandleDeviceSelector;
        let count = selector.device_count().expect("driver reports a device count");
        assert!(count >= 1);
        assert!(selector.select(0).unwrap().is_cuda());
    }

    #[test]
    fn out_of_range_ordinal_reports_visibility() {
        let env = LaunchEnv::from_pairs([(CUDA_VISIBLE_DEVICES, "0,1")]);
        let err = select_local_device(&FakeGpus { count: 2 }, 2, &env).unwrap_err();
        match err {
            DistributedError::DeviceSelection {
                ordinal,
                visible_devices,
                reason,
            } => {
                assert_eq!(ordinal, 2);
                assert_eq!(visible_devices.as_deref(), Some("0,1"));
                assert!(reason.contains("ordinal 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
