//! Simulated XYZ liquid handler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;

use super::common::{default_communication_delay, parse_settings, SimLink, SimMode};
use crate::device::deck::{BedAssignment, Deck};
use crate::device::{Capability, DeviceComponents, Instrument, LiquidHandler, Reading};
use crate::registry::{DriverContext, DriverFactory};

/// Settings of [`SimLiquidHandler`].
#[derive(Debug, Clone, Deserialize)]
pub struct SimLiquidHandlerConfig {
    /// Timing mode.
    #[serde(default)]
    pub mode: SimMode,
    /// Bed extent along X in mm.
    #[serde(default = "default_x_travel")]
    pub x_travel_mm: f64,
    /// Bed extent along Y in mm.
    #[serde(default = "default_y_travel")]
    pub y_travel_mm: f64,
    /// Probe travel along Z in mm (0 is fully raised).
    #[serde(default = "default_z_travel")]
    pub z_travel_mm: f64,
    /// Racks on the deck, for well addressing.
    #[serde(default)]
    pub beds: Vec<BedAssignment>,
    /// Axis speed in mm/s.
    #[serde(default = "default_speed")]
    pub speed_mm_per_sec: f64,
    /// Delay per command.
    #[serde(default = "default_communication_delay", with = "humantime_serde")]
    pub communication_delay: Duration,
}

// A six-bed deck.
fn default_x_travel() -> f64 {
    720.0
}

fn default_y_travel() -> f64 {
    400.0
}

fn default_z_travel() -> f64 {
    125.0
}

fn default_speed() -> f64 {
    100.0
}

static HANDLER_CAPABILITIES: &[Capability] = &[
    Capability::MoveXy,
    Capability::MoveZ,
    Capability::ReadZ,
    Capability::HomeAxes,
    Capability::MoveToWell,
    Capability::LowerToWell,
];

/// Factory for [`SimLiquidHandler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimLiquidHandlerFactory;

impl DriverFactory for SimLiquidHandlerFactory {
    fn name(&self) -> &'static str {
        "Simulated liquid handler"
    }

    fn capabilities(&self) -> &'static [Capability] {
        HANDLER_CAPABILITIES
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: SimLiquidHandlerConfig = parse_settings(settings)?;
        if cfg.speed_mm_per_sec <= 0.0 {
            bail!("speed_mm_per_sec must be positive");
        }
        Deck::new(&cfg.beds)?;
        Ok(())
    }

    fn build(&self, ctx: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SimLiquidHandlerConfig = parse_settings(&ctx.spec.settings)?;
            let link = SimLink::new(&ctx, cfg.mode, cfg.communication_delay);
            let deck = Deck::new(&cfg.beds)?;
            let handler = Arc::new(SimLiquidHandler {
                cfg,
                deck,
                link,
                position: Mutex::new([0.0; 3]),
            });
            handler.link.command("INIT").await?;
            Ok(DeviceComponents::new(handler.clone()).with_liquid_handler(handler))
        })
    }
}

/// Simulated gantry with a single probe.
#[derive(Debug)]
pub struct SimLiquidHandler {
    cfg: SimLiquidHandlerConfig,
    deck: Deck,
    link: SimLink,
    position: Mutex<[f64; 3]>,
}

impl SimLiquidHandler {
    fn check(axis: &str, value: f64, travel: f64) -> Result<()> {
        if !(0.0..=travel).contains(&value) {
            bail!("{axis} = {value} mm outside [0, {travel}]");
        }
        Ok(())
    }

    async fn travel(&self, command: String, target: [f64; 3]) -> Result<()> {
        let from = *self.position.lock();
        let distance = from
            .iter()
            .zip(target.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        let duration = Duration::try_from_secs_f64(distance / self.cfg.speed_mm_per_sec)
            .map_err(|_| anyhow!("move of {distance} mm has no finite duration"))?;
        self.link.command(command).await?;
        self.link.pause(duration).await;
        *self.position.lock() = target;
        Ok(())
    }
}

#[async_trait]
impl Instrument for SimLiquidHandler {
    async fn safe_stop(&self) -> Result<()> {
        // Raise the probe first so a stopped gantry never leaves it in a vessel.
        let [x, y, _] = *self.position.lock();
        self.travel("Z 0.0".to_string(), [x, y, 0.0]).await?;
        self.travel("HOME".to_string(), [0.0, 0.0, 0.0]).await
    }

    async fn sample(&self) -> Result<Vec<Reading>> {
        let [_, _, z] = *self.position.lock();
        Ok(vec![Reading::new("z", z, "mm")])
    }
}

#[async_trait]
impl LiquidHandler for SimLiquidHandler {
    async fn move_xy(&self, x_mm: f64, y_mm: f64) -> Result<()> {
        Self::check("x", x_mm, self.cfg.x_travel_mm)?;
        Self::check("y", y_mm, self.cfg.y_travel_mm)?;
        let [_, _, z] = *self.position.lock();
        if z > 0.0 {
            bail!("probe lowered to {z} mm; raise it before moving in XY");
        }
        self.travel(format!("XY {x_mm:.2} {y_mm:.2}"), [x_mm, y_mm, z])
            .await
    }

    async fn move_z(&self, z_mm: f64) -> Result<()> {
        Self::check("z", z_mm, self.cfg.z_travel_mm)?;
        let [x, y, _] = *self.position.lock();
        self.travel(format!("Z {z_mm:.2}"), [x, y, z_mm]).await
    }

    async fn read_z(&self) -> Result<f64> {
        self.link.command("Z?").await?;
        Ok(self.position.lock()[2])
    }

    async fn home(&self) -> Result<()> {
        self.travel("HOME".to_string(), [0.0, 0.0, 0.0]).await
    }

    async fn move_to_well(&self, bed: u32, well: u32) -> Result<()> {
        let target = self.deck.locate(bed, well)?;
        let [x, y, z] = *self.position.lock();
        if z > 0.0 {
            self.travel("Z 0.0".to_string(), [x, y, 0.0]).await?;
        }
        self.move_xy(target.x_mm, target.y_mm).await
    }

    async fn lower_to_well(&self, bed: u32, well: u32) -> Result<()> {
        let target = self.deck.locate(bed, well)?;
        let [x, y, _] = *self.position.lock();
        if (x - target.x_mm).abs() > 0.01 || (y - target.y_mm).abs() > 0.01 {
            bail!("probe is not over bed {bed} well {well}; move to the well first");
        }
        self.move_z(self.cfg.z_travel_mm - target.height_mm).await
    }
}
