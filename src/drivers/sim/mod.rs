//! Simulated drivers.
//!
//! Deterministic stand-ins for every device category. They talk through a
//! [`SimulatedTransport`](crate::transport::SimulatedTransport) so connection
//! faults behave exactly as with hardware, and their timing runs on the tokio
//! clock so tests can pause and advance time.

pub mod common;
pub mod detector;
pub mod liquid_handler;
pub mod pump;
pub mod thermal;
pub mod valve;

pub use common::{SimLink, SimMode};
pub use detector::{SimDetector, SimDetectorFactory};
pub use liquid_handler::{SimLiquidHandler, SimLiquidHandlerFactory};
pub use pump::{SimPump, SimPumpFactory};
pub use thermal::{SimTemperatureController, SimThermalFactory};
pub use valve::{SimValve, SimValveFactory};
