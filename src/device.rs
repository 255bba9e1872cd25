// src/device.rs

//! Execution backends an operator can run under.

use std::fmt;

use log::trace;
use tch::{Cuda, Device};

/// A device configuration: CPU or one CUDA device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOption {
    device: Device,
}

impl DeviceOption {
    pub fn cpu() -> Self {
        DeviceOption {
            device: Device::Cpu,
        }
    }

    pub fn cuda(index: usize) -> Self {
        DeviceOption {
            device: Device::Cuda(index),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_cuda(&self) -> bool {
        self.device.is_cuda()
    }
}

impl From<Device> for DeviceOption {
    fn from(device: Device) -> Self {
        DeviceOption { device }
    }
}

impl fmt::Display for DeviceOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Device::Cuda(index) => write!(f, "cuda:{}", index),
            Device::Cpu => f.write_str("cpu"),
            other => write!(f, "{:?}", other),
        }
    }
}

/// All device configurations available in this process: the CPU, followed
/// by every visible CUDA device.
pub fn available_devices() -> Vec<DeviceOption> {
    let mut devices = vec![DeviceOption::cpu()];
    if Cuda::is_available() {
        let count = Cuda::device_count().max(0) as usize;
        devices.extend((0..count).map(DeviceOption::cuda));
    }
    trace!(
        "Available devices: {}",
        devices
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    devices
}

/// The `(gc, dc)` pair used by the checks: the device to run single-device
/// checks on, and the list of devices to compare against each other.
///
/// `gc` is the first accelerator when one is present, the CPU otherwise.
pub fn gcs() -> (DeviceOption, Vec<DeviceOption>) {
    let dc = available_devices();
    let gc = dc
        .iter()
        .copied()
        .find(DeviceOption::is_cuda)
        .unwrap_or_else(DeviceOption::cpu);
    (gc, dc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_always_available() {
        let devices = available_devices();
        assert_eq!(devices.first(), Some(&DeviceOption::cpu()));
        let (gc, dc) = gcs();
        assert!(dc.contains(&gc));
        assert_eq!(dc.len(), devices.len());
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceOption::cpu().to_string(), "cpu");
        assert_eq!(DeviceOption::cuda(1).to_string(), "cuda:1");
        assert_eq!(DeviceOption::from(Device::Cuda(0)), DeviceOption::cuda(0));
    }
}
