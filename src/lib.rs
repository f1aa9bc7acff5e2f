//! # autolab
//!
//! Device abstraction and method execution engine for laboratory automation.
//! Heterogeneous instruments (pumps, liquid handlers, temperature
//! controllers, valves, detectors) sit behind one capability-based device
//! interface, and multi-step experiment *methods* run over them with fault
//! containment, bounded timing and safe abort.
//!
//! ## Crate Structure
//!
//! - **`device`**: categories, capabilities, the per-category driver traits
//!   and the runtime [`DeviceHandle`](device::DeviceHandle) state machine.
//! - **`transport`**: line-oriented transports (simulated, TCP, serial).
//! - **`connection`**: the [`ConnectionManager`](connection::ConnectionManager):
//!   exclusive address claims, open/close, reconnect with backoff.
//! - **`registry`**: the [`DriverRegistry`](registry::DriverRegistry) mapping
//!   `(category, vendor/model)` to driver factories.
//! - **`drivers`**: built-in simulated drivers.
//! - **`method`**: method definitions, builder and static validation.
//! - **`engine`**: the [`MethodEngine`](engine::MethodEngine) and run records.
//! - **`bus`**: the in-process event and telemetry bus.
//! - **`safety`**: safety rules, interlock and the monitor task.
//! - **`recorder`**: CSV run log (feature `storage_csv`).
//! - **`config`**, **`logging`**: Figment configuration and tracing setup.
//! - **`lab`**: the [`Lab`](lab::Lab) composition root.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use autolab::config::LabConfig;
//! use autolab::device::{DeviceCategory, DeviceSpec, Operation};
//! use autolab::engine::RoleBindings;
//! use autolab::lab::Lab;
//! use autolab::method::{MethodDefinition, Step};
//!
//! # async fn demo() -> Result<(), autolab::error::LabError> {
//! let config = LabConfig {
//!     devices: vec![
//!         DeviceSpec::simulated(DeviceCategory::TemperatureController, "heater", "heater"),
//!         DeviceSpec::simulated(DeviceCategory::Pump, "syringe", "pump"),
//!     ],
//!     ..Default::default()
//! };
//! let lab = Lab::start(config).await?;
//!
//! let method = MethodDefinition::builder("heat_and_dispense")
//!     .role("heater", DeviceCategory::TemperatureController)
//!     .role("pump", DeviceCategory::Pump)
//!     .then(Step::new("set_temp", "heater", Operation::SetSetpoint { celsius: 40.0 }))
//!     .then(
//!         Step::new(
//!             "wait_stable",
//!             "heater",
//!             Operation::WaitStable {
//!                 target_celsius: 40.0,
//!                 tolerance_celsius: 0.5,
//!                 poll_interval: Duration::from_millis(500),
//!             },
//!         )
//!         .timeout(Duration::from_secs(30)),
//!     )
//!     .then(Step::new(
//!         "dispense",
//!         "pump",
//!         Operation::Dispense { volume_ul: 2000.0, ul_per_min: 6000.0 },
//!     ))
//!     .build();
//!
//! let run = lab.engine().submit(method, &RoleBindings::new())?;
//! let report = run.wait().await;
//! println!("{}: {}", report.method, report.status);
//! lab.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod device;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod lab;
pub mod limits;
pub mod logging;
pub mod method;
pub mod registry;
pub mod safety;
pub mod transport;

#[cfg(feature = "storage_csv")]
pub mod recorder;

pub use error::{LabError, LabResult};
