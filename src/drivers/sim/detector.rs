//! Simulated UV/VIS absorbance detector.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;

use super::common::{default_communication_delay, parse_settings, SimLink, SimMode};
use crate::device::{Capability, DeviceComponents, Detector, Instrument, Reading};
use crate::registry::{DriverContext, DriverFactory};

/// Settings of [`SimDetector`].
#[derive(Debug, Clone, Deserialize)]
pub struct SimDetectorConfig {
    /// Timing mode.
    #[serde(default)]
    pub mode: SimMode,
    /// Monitored wavelength.
    #[serde(default = "default_wavelength")]
    pub wavelength_nm: f64,
    /// Absorbance of the blank.
    #[serde(default = "default_baseline")]
    pub baseline_absorbance: f64,
    /// Uniform noise amplitude in absorbance units.
    #[serde(default)]
    pub noise: f64,
    /// Initial integration time.
    #[serde(default = "default_integration", with = "humantime_serde")]
    pub integration_time: Duration,
    /// Delay per command.
    #[serde(default = "default_communication_delay", with = "humantime_serde")]
    pub communication_delay: Duration,
}

fn default_wavelength() -> f64 {
    254.0
}

fn default_baseline() -> f64 {
    0.05
}

fn default_integration() -> Duration {
    Duration::from_millis(100)
}

static DETECTOR_CAPABILITIES: &[Capability] =
    &[Capability::SetIntegrationTime, Capability::Acquire];

/// Factory for [`SimDetector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SimDetectorFactory;

impl DriverFactory for SimDetectorFactory {
    fn name(&self) -> &'static str {
        "Simulated UV detector"
    }

    fn capabilities(&self) -> &'static [Capability] {
        DETECTOR_CAPABILITIES
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: SimDetectorConfig = parse_settings(settings)?;
        if cfg.wavelength_nm <= 0.0 {
            bail!("wavelength_nm must be positive");
        }
        Ok(())
    }

    fn build(&self, ctx: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SimDetectorConfig = parse_settings(&ctx.spec.settings)?;
            let link = SimLink::new(&ctx, cfg.mode, cfg.communication_delay);
            let detector = Arc::new(SimDetector {
                integration: Mutex::new(cfg.integration_time),
                cfg,
                link,
            });
            detector
                .link
                .command(format!("WL {:.1}", detector.cfg.wavelength_nm))
                .await?;
            Ok(DeviceComponents::new(detector.clone()).with_detector(detector))
        })
    }
}

/// Simulated single-wavelength absorbance detector.
#[derive(Debug)]
pub struct SimDetector {
    cfg: SimDetectorConfig,
    link: SimLink,
    integration: Mutex<Duration>,
}

#[async_trait]
impl Instrument for SimDetector {
    async fn safe_stop(&self) -> Result<()> {
        self.link.command("LAMP OFF").await?;
        Ok(())
    }
}

#[async_trait]
impl Detector for SimDetector {
    async fn set_integration_time(&self, seconds: f64) -> Result<()> {
        if !(seconds > 0.0 && seconds <= 60.0) {
            bail!("integration time {seconds} s outside (0, 60]");
        }
        self.link.command(format!("INT {seconds:.3}")).await?;
        *self.integration.lock() = Duration::from_secs_f64(seconds);
        Ok(())
    }

    async fn acquire(&self) -> Result<Reading> {
        let integration = *self.integration.lock();
        self.link.command("ACQ").await?;
        self.link.pause(integration).await;
        let mut absorbance = self.cfg.baseline_absorbance;
        if self.cfg.noise > 0.0 {
            absorbance += rand::thread_rng().gen_range(-self.cfg.noise..=self.cfg.noise);
        }
        Ok(Reading::new(
            format!("absorbance_{:.0}nm", self.cfg.wavelength_nm),
            absorbance,
            "AU",
        ))
    }
}
