//! Simulated selector valve.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;

use super::common::{default_communication_delay, parse_settings, SimLink, SimMode};
use crate::device::{Capability, DeviceComponents, Instrument, Reading, Valve};
use crate::registry::{DriverContext, DriverFactory};

/// Settings of [`SimValve`].
#[derive(Debug, Clone, Deserialize)]
pub struct SimValveConfig {
    /// Timing mode.
    #[serde(default)]
    pub mode: SimMode,
    /// Number of ports.
    #[serde(default = "default_ports")]
    pub ports: u32,
    /// Port selected by `home`.
    #[serde(default = "default_home")]
    pub home_position: u32,
    /// Time to rotate by one port.
    #[serde(default = "default_step_time", with = "humantime_serde")]
    pub step_time: Duration,
    /// Delay per command.
    #[serde(default = "default_communication_delay", with = "humantime_serde")]
    pub communication_delay: Duration,
}

fn default_ports() -> u32 {
    6
}

fn default_home() -> u32 {
    1
}

fn default_step_time() -> Duration {
    Duration::from_millis(50)
}

static VALVE_CAPABILITIES: &[Capability] = &[
    Capability::SelectPosition,
    Capability::ReadPosition,
    Capability::HomeValve,
];

/// Factory for [`SimValve`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimValveFactory;

impl DriverFactory for SimValveFactory {
    fn name(&self) -> &'static str {
        "Simulated selector valve"
    }

    fn capabilities(&self) -> &'static [Capability] {
        VALVE_CAPABILITIES
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: SimValveConfig = parse_settings(settings)?;
        if cfg.ports == 0 || cfg.home_position == 0 || cfg.home_position > cfg.ports {
            bail!("home_position must be within 1..={}", cfg.ports);
        }
        Ok(())
    }

    fn build(&self, ctx: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SimValveConfig = parse_settings(&ctx.spec.settings)?;
            let link = SimLink::new(&ctx, cfg.mode, cfg.communication_delay);
            let valve = Arc::new(SimValve {
                position: Mutex::new(cfg.home_position),
                cfg,
                link,
            });
            valve.link.command("INIT").await?;
            Ok(DeviceComponents::new(valve.clone()).with_valve(valve))
        })
    }
}

/// Simulated rotary selector valve. Rotation time grows with port distance.
#[derive(Debug)]
pub struct SimValve {
    cfg: SimValveConfig,
    link: SimLink,
    position: Mutex<u32>,
}

impl SimValve {
    async fn rotate_to(&self, target: u32) -> Result<()> {
        let current = *self.position.lock();
        let distance = current.abs_diff(target);
        self.link.command(format!("GO {target}")).await?;
        self.link.pause(self.cfg.step_time * distance).await;
        *self.position.lock() = target;
        self.link
            .telemetry()
            .publish("position", f64::from(target), "port");
        Ok(())
    }
}

#[async_trait]
impl Instrument for SimValve {
    async fn safe_stop(&self) -> Result<()> {
        self.rotate_to(self.cfg.home_position).await
    }

    async fn sample(&self) -> Result<Vec<Reading>> {
        Ok(vec![Reading::new(
            "position",
            f64::from(*self.position.lock()),
            "port",
        )])
    }
}

#[async_trait]
impl Valve for SimValve {
    async fn select_position(&self, position: u32) -> Result<()> {
        if position == 0 || position > self.cfg.ports {
            bail!("port {position} outside 1..={}", self.cfg.ports);
        }
        self.rotate_to(position).await
    }

    async fn read_position(&self) -> Result<u32> {
        self.link.command("POS?").await?;
        Ok(*self.position.lock())
    }

    async fn home(&self) -> Result<()> {
        self.rotate_to(self.cfg.home_position).await
    }
}
