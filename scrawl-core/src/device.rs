use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use rand::Rng;
use tracing::info;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal)
            .map_err(|e| Error::setup(format!("failed to open cuda device {ordinal}: {e}"))),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal)
            .map_err(|e| Error::setup(format!("failed to open metal device {ordinal}: {e}"))),
        DeviceMap::Ordinal(_) => {
            info!("no accelerator available, falling back to cpu");
            Ok(Device::Cpu)
        }
    }
}

/// Seeds the device RNG for a request, drawing a fresh seed when the request
/// does not carry one. The seed in effect is always returned so every run can
/// be reproduced after the fact.
pub fn seed_device(device: &Device, requested: Option<u64>) -> Result<u64> {
    let seed = match requested {
        Some(seed) => seed,
        None => rand::rng().random(),
    };
    device.set_seed(seed)?;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_device_map_targets_first_accelerator() {
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }

    #[test]
    fn force_cpu_is_honored() -> Result<()> {
        let device = select_best_device(DeviceMap::ForceCpu)?;
        assert!(device.is_cpu());
        Ok(())
    }

    #[test]
    fn requested_seed_is_applied_verbatim() -> Result<()> {
        let device = Device::Cpu;
        assert_eq!(seed_device(&device, Some(42))?, 42);
        Ok(())
    }

    #[test]
    fn absent_seed_draws_one() -> Result<()> {
        let device = Device::Cpu;
        // Two draws colliding is possible but vanishingly unlikely.
        let a = seed_device(&device, None)?;
        let b = seed_device(&device, None)?;
        assert!(a != b || a != seed_device(&device, None)?);
        Ok(())
    }
}
