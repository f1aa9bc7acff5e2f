//! Simulated temperature controller.
//!
//! First-order thermal model evaluated on the tokio clock:
//!
//! ```text
//! T(t) = T_eq + (T_0 - T_eq) · exp(-(t - t_0) / τ)      T_eq = setpoint + offset
//! ```
//!
//! A non-zero `steady_state_offset_celsius` models a controller that never
//! settles on its setpoint (undersized heater, poor loop tuning).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;

use super::common::{default_communication_delay, parse_settings, SimLink, SimMode};
use crate::device::{Capability, DeviceComponents, Instrument, Reading, TemperatureController};
use crate::registry::{DriverContext, DriverFactory};

/// Settings of [`SimTemperatureController`].
#[derive(Debug, Clone, Deserialize)]
pub struct SimThermalConfig {
    /// Timing mode. Instant mode jumps straight to equilibrium.
    #[serde(default)]
    pub mode: SimMode,
    /// Start temperature.
    #[serde(default = "default_ambient")]
    pub ambient_celsius: f64,
    /// Thermal time constant τ.
    #[serde(default = "default_time_constant", with = "humantime_serde")]
    pub time_constant: Duration,
    /// Equilibrium error relative to the setpoint.
    #[serde(default)]
    pub steady_state_offset_celsius: f64,
    /// Uniform noise amplitude added to readings.
    #[serde(default)]
    pub noise_celsius: f64,
    /// Setpoint applied by a safe stop.
    #[serde(default = "default_ambient")]
    pub safe_setpoint_celsius: f64,
    /// Accepted setpoint range.
    #[serde(default = "default_min_setpoint")]
    pub min_setpoint_celsius: f64,
    /// Accepted setpoint range.
    #[serde(default = "default_max_setpoint")]
    pub max_setpoint_celsius: f64,
    /// Delay per command.
    #[serde(default = "default_communication_delay", with = "humantime_serde")]
    pub communication_delay: Duration,
}

fn default_ambient() -> f64 {
    25.0
}

fn default_time_constant() -> Duration {
    Duration::from_secs(5)
}

fn default_min_setpoint() -> f64 {
    -20.0
}

fn default_max_setpoint() -> f64 {
    150.0
}

static THERMAL_CAPABILITIES: &[Capability] =
    &[Capability::SetSetpoint, Capability::ReadTemperature];

/// Factory for [`SimTemperatureController`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimThermalFactory;

impl DriverFactory for SimThermalFactory {
    fn name(&self) -> &'static str {
        "Simulated temperature controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        THERMAL_CAPABILITIES
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: SimThermalConfig = parse_settings(settings)?;
        if cfg.time_constant.is_zero() {
            bail!("time_constant must be non-zero");
        }
        if cfg.min_setpoint_celsius >= cfg.max_setpoint_celsius {
            bail!("min_setpoint_celsius must be below max_setpoint_celsius");
        }
        Ok(())
    }

    fn build(&self, ctx: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SimThermalConfig = parse_settings(&ctx.spec.settings)?;
            let link = SimLink::new(&ctx, cfg.mode, cfg.communication_delay);
            let controller = Arc::new(SimTemperatureController::new(cfg, link));
            controller.link.command("INIT").await?;
            Ok(DeviceComponents::new(controller.clone()).with_temperature_controller(controller))
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Ramp {
    from: f64,
    setpoint: f64,
    since: Instant,
}

/// Simulated heater/chiller.
#[derive(Debug)]
pub struct SimTemperatureController {
    cfg: SimThermalConfig,
    link: SimLink,
    ramp: Mutex<Ramp>,
}

impl SimTemperatureController {
    fn new(cfg: SimThermalConfig, link: SimLink) -> Self {
        let ramp = Ramp {
            from: cfg.ambient_celsius,
            setpoint: cfg.ambient_celsius,
            since: Instant::now(),
        };
        Self {
            cfg,
            link,
            ramp: Mutex::new(ramp),
        }
    }

    fn model_temperature(&self, ramp: &Ramp, at: Instant) -> f64 {
        let equilibrium = ramp.setpoint + self.cfg.steady_state_offset_celsius;
        if self.link.mode() == SimMode::Instant {
            return equilibrium;
        }
        let t = at.saturating_duration_since(ramp.since).as_secs_f64();
        let tau = self.cfg.time_constant.as_secs_f64();
        equilibrium + (ramp.from - equilibrium) * (-t / tau).exp()
    }

    fn current(&self) -> f64 {
        let ramp = *self.ramp.lock();
        let mut value = self.model_temperature(&ramp, Instant::now());
        if self.cfg.noise_celsius > 0.0 {
            let amplitude = self.cfg.noise_celsius;
            value += rand::thread_rng().gen_range(-amplitude..=amplitude);
        }
        value
    }

    fn retarget(&self, setpoint: f64) {
        let now = Instant::now();
        let mut ramp = self.ramp.lock();
        let from = self.model_temperature(&ramp, now);
        *ramp = Ramp {
            from,
            setpoint,
            since: now,
        };
    }
}

#[async_trait]
impl Instrument for SimTemperatureController {
    async fn safe_stop(&self) -> Result<()> {
        let safe = self.cfg.safe_setpoint_celsius;
        self.link.command(format!("SAFE {safe:.1}")).await?;
        self.retarget(safe);
        Ok(())
    }

    async fn sample(&self) -> Result<Vec<Reading>> {
        Ok(vec![Reading::new("temperature", self.current(), "degC")])
    }
}

#[async_trait]
impl TemperatureController for SimTemperatureController {
    async fn set_setpoint(&self, celsius: f64) -> Result<()> {
        if celsius < self.cfg.min_setpoint_celsius || celsius > self.cfg.max_setpoint_celsius {
            bail!(
                "setpoint {celsius} °C outside [{}, {}]",
                self.cfg.min_setpoint_celsius,
                self.cfg.max_setpoint_celsius
            );
        }
        self.link.command(format!("SET {celsius:.2}")).await?;
        self.retarget(celsius);
        Ok(())
    }

    async fn read_temperature(&self) -> Result<f64> {
        self.link.command("TEMP?").await?;
        Ok(self.current())
    }
}
