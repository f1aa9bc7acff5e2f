//! Shared pieces of the simulated drivers.

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::bus::TelemetrySink;
use crate::registry::DriverContext;
use crate::transport::{self, SharedTransport};

/// Operational modes for simulated devices
///
/// - **Instant**: zero delays, for unit tests of surrounding logic
/// - **Realistic**: hardware-like timing driven by the tokio clock, so tests
///   with a paused clock stay fast and deterministic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimMode {
    /// Zero delays.
    Instant,
    /// Hardware-like timing.
    #[default]
    Realistic,
}

/// Command channel of a simulated driver.
///
/// Every command goes through the real transport so a broken or closed link
/// surfaces as a transport error, exactly as with hardware.
#[derive(Clone)]
pub struct SimLink {
    transport: SharedTransport,
    telemetry: TelemetrySink,
    mode: SimMode,
    communication_delay: Duration,
}

impl std::fmt::Debug for SimLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimLink")
            .field("device", &self.device_id())
            .field("mode", &self.mode)
            .field("communication_delay", &self.communication_delay)
            .finish()
    }
}

impl SimLink {
    pub(crate) fn new(ctx: &DriverContext, mode: SimMode, communication_delay: Duration) -> Self {
        Self {
            transport: ctx.transport.clone(),
            telemetry: ctx.telemetry.clone(),
            mode,
            communication_delay,
        }
    }

    /// Send one command and wait for the acknowledgement.
    pub async fn command(&self, command: impl AsRef<str>) -> Result<String> {
        let reply = transport::exchange(&self.transport, command.as_ref()).await?;
        self.pause(self.communication_delay).await;
        Ok(reply)
    }

    /// Sleep for `duration` unless running in instant mode.
    pub async fn pause(&self, duration: Duration) {
        if self.mode == SimMode::Realistic && !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    /// Telemetry publisher.
    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    /// Device id for error messages.
    pub fn device_id(&self) -> &str {
        self.telemetry.device_id()
    }

    /// Mode in effect.
    pub fn mode(&self) -> SimMode {
        self.mode
    }
}

pub(crate) fn default_communication_delay() -> Duration {
    Duration::from_millis(5)
}

/// Deserialize driver settings, treating a missing table as defaults.
pub(crate) fn parse_settings<T>(settings: &toml::Value) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    Ok(settings.clone().try_into()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Example {
        #[serde(default)]
        mode: SimMode,
        #[serde(default = "default_communication_delay", with = "humantime_serde")]
        delay: Duration,
    }

    #[test]
    fn empty_settings_take_defaults() {
        let parsed: Example =
            parse_settings(&toml::Value::Table(toml::map::Map::new())).unwrap();
        assert_eq!(parsed.mode, SimMode::Realistic);
        assert_eq!(parsed.delay, Duration::from_millis(5));
    }

    #[test]
    fn link_debug_names_the_device() {
        use std::sync::Arc;

        use crate::bus::EventBus;
        use crate::device::{ConnectionDescriptor, DeviceCategory, DeviceSpec};
        use crate::transport::{SimulatedConnector, TransportConnector};

        let transport = SimulatedConnector::new()
            .connect(&ConnectionDescriptor::simulated("p1"))
            .unwrap();
        let ctx = DriverContext {
            spec: Arc::new(DeviceSpec::simulated(DeviceCategory::Pump, "syringe", "p1")),
            transport: Arc::new(tokio::sync::Mutex::new(transport)),
            telemetry: TelemetrySink::new(EventBus::new(), DeviceCategory::Pump, "p1"),
        };
        let link = SimLink::new(&ctx, SimMode::Instant, Duration::ZERO);

        let text = format!("{link:?}");
        assert!(text.contains("\"p1\""), "{text}");
        assert!(text.contains("Instant"), "{text}");
    }

    #[test]
    fn instant_mode_parses() {
        let value: toml::Value = toml::from_str("mode = \"instant\"\ndelay = \"1ms\"").unwrap();
        let parsed: Example = parse_settings(&value).unwrap();
        assert_eq!(parsed.mode, SimMode::Instant);
        assert_eq!(parsed.delay, Duration::from_millis(1));
    }
}
