//! Built-in drivers.
//!
//! Only simulated drivers ship with the crate; vendor drivers live in their
//! own crates and register themselves with the [`DriverRegistry`] at startup.

pub mod sim;

use crate::device::DeviceCategory;
use crate::error::LabResult;
use crate::registry::DriverRegistry;

/// Vendor name of the simulated drivers.
pub const SIM_VENDOR: &str = "sim";

/// Register every simulated driver under vendor `sim`.
///
/// | Category | vendor/model |
/// |---|---|
/// | Pump | `sim/syringe`, `sim/peristaltic` |
/// | TemperatureController | `sim/heater` |
/// | Valve | `sim/selector` |
/// | LiquidHandler | `sim/gantry` |
/// | Detector | `sim/uv` |
pub fn register_simulated_drivers(registry: &DriverRegistry) -> LabResult<()> {
    registry.register(
        DeviceCategory::Pump,
        "sim/syringe",
        sim::SimPumpFactory::syringe(),
    )?;
    registry.register(
        DeviceCategory::Pump,
        "sim/peristaltic",
        sim::SimPumpFactory::peristaltic(),
    )?;
    registry.register(
        DeviceCategory::TemperatureController,
        "sim/heater",
        sim::SimThermalFactory,
    )?;
    registry.register(DeviceCategory::Valve, "sim/selector", sim::SimValveFactory)?;
    registry.register(
        DeviceCategory::LiquidHandler,
        "sim/gantry",
        sim::SimLiquidHandlerFactory,
    )?;
    registry.register(DeviceCategory::Detector, "sim/uv", sim::SimDetectorFactory)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_each_category_once() {
        let registry = DriverRegistry::new();
        register_simulated_drivers(&registry).unwrap();
        assert_eq!(registry.len(), 6);
        for category in DeviceCategory::ALL {
            assert!(
                registry.list().iter().any(|f| f.key.category == category),
                "{category}"
            );
        }

        // A second registration pass must not silently shadow anything.
        assert!(register_simulated_drivers(&registry).is_err());
    }
}
