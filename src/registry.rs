//! Driver Registry
//!
//! Maps `(category, vendor/model)` to a [`DriverFactory`] that builds a
//! driver implementing the category's capability contract.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Composition root (Lab)                      │
//! │  drivers::register_simulated_drivers(&registry)?;              │
//! │  registry.register(Pump, "acme/p100", AcmeFactory)?;           │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DriverRegistry                           │
//! │  factories: DashMap<DriverKey, Arc<dyn DriverFactory>>         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                   │ resolve
//!                                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          DriverFactory::build(DriverContext)                    │
//! │  Parses TOML settings, wraps the transport, returns components │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any crate holding the registry can add drivers; nothing central has to
//! be edited. Registering a key twice is an error unless the caller opts
//! into replacing the existing factory with [`DriverRegistry::register_override`].

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::TelemetrySink;
use crate::device::{Capability, DeviceCategory, DeviceComponents, SharedSpec};
use crate::error::{LabError, LabResult};
use crate::transport::SharedTransport;

/// Everything a factory needs to build a driver instance.
#[derive(Clone)]
pub struct DriverContext {
    /// Device registration record.
    pub spec: SharedSpec,
    /// Opened transport, exclusively owned by the device handle.
    pub transport: SharedTransport,
    /// Telemetry publisher for this device.
    pub telemetry: TelemetrySink,
}

/// Builds driver instances for one `(category, vendor/model)`.
pub trait DriverFactory: Send + Sync + 'static {
    /// Human-readable name, e.g. `"Simulated syringe pump"`.
    fn name(&self) -> &'static str;

    /// Capabilities the built driver supports. Anything in the category
    /// contract that is missing here is refused before reaching the driver.
    fn capabilities(&self) -> &'static [Capability];

    /// Validate driver settings without touching hardware.
    fn validate(&self, settings: &toml::Value) -> anyhow::Result<()>;

    /// Build a driver bound to an opened transport.
    fn build(&self, ctx: DriverContext) -> BoxFuture<'static, anyhow::Result<DeviceComponents>>;
}

/// Registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DriverKey {
    /// Device category.
    pub category: DeviceCategory,
    /// `"{vendor}/{model}"`.
    pub vendor_model: String,
}

impl fmt::Display for DriverKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.vendor_model)
    }
}

/// Introspection record for a registered factory.
#[derive(Debug, Clone, Serialize)]
pub struct FactoryInfo {
    /// Registry key.
    pub key: DriverKey,
    /// Factory name.
    pub name: String,
    /// Declared capabilities.
    pub capabilities: Vec<Capability>,
}

/// Process-wide registry of driver factories.
///
/// Written at startup, read on every `open`.
#[derive(Default)]
pub struct DriverRegistry {
    factories: DashMap<DriverKey, Arc<dyn DriverFactory>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Fails with [`LabError::DriverConflict`] if the key
    /// is taken.
    pub fn register<F: DriverFactory>(
        &self,
        category: DeviceCategory,
        vendor_model: &str,
        factory: F,
    ) -> LabResult<()> {
        let key = DriverKey {
            category,
            vendor_model: vendor_model.to_string(),
        };
        match self.factories.entry(key) {
            Entry::Occupied(existing) => Err(LabError::DriverConflict {
                category,
                vendor_model: vendor_model.to_string(),
                existing: existing.get().name().to_string(),
            }),
            Entry::Vacant(slot) => {
                info!(
                    category = %category,
                    vendor_model = %vendor_model,
                    name = %factory.name(),
                    capabilities = ?factory.capabilities(),
                    "Registering driver factory"
                );
                slot.insert(Arc::new(factory));
                Ok(())
            }
        }
    }

    /// Register a factory, replacing any existing one for the key.
    ///
    /// Returns the name of the replaced factory.
    pub fn register_override<F: DriverFactory>(
        &self,
        category: DeviceCategory,
        vendor_model: &str,
        factory: F,
    ) -> Option<String> {
        let key = DriverKey {
            category,
            vendor_model: vendor_model.to_string(),
        };
        let name = factory.name();
        let replaced = self
            .factories
            .insert(key, Arc::new(factory))
            .map(|old| old.name().to_string());
        if let Some(old) = &replaced {
            warn!(
                category = %category,
                vendor_model = %vendor_model,
                replaced = %old,
                name = %name,
                "Driver factory overridden"
            );
        }
        replaced
    }

    /// Factory for `(category, vendor_model)`.
    pub fn resolve(
        &self,
        category: DeviceCategory,
        vendor_model: &str,
    ) -> LabResult<Arc<dyn DriverFactory>> {
        let key = DriverKey {
            category,
            vendor_model: vendor_model.to_string(),
        };
        self.factories
            .get(&key)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| LabError::DriverNotFound {
                category,
                vendor_model: vendor_model.to_string(),
            })
    }

    /// Remove a factory.
    pub fn unregister(&self, category: DeviceCategory, vendor_model: &str) -> bool {
        let key = DriverKey {
            category,
            vendor_model: vendor_model.to_string(),
        };
        self.factories.remove(&key).is_some()
    }

    /// All registered factories, sorted by key.
    pub fn list(&self) -> Vec<FactoryInfo> {
        let mut infos: Vec<_> = self
            .factories
            .iter()
            .map(|entry| FactoryInfo {
                key: entry.key().clone(),
                name: entry.value().name().to_string(),
                capabilities: entry.value().capabilities().to_vec(),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no factory is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Instrument;
    use async_trait::async_trait;

    struct Inert;

    #[async_trait]
    impl Instrument for Inert {
        async fn safe_stop(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct NamedFactory(&'static str);

    impl DriverFactory for NamedFactory {
        fn name(&self) -> &'static str {
            self.0
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::SelectPosition]
        }

        fn validate(&self, _settings: &toml::Value) -> anyhow::Result<()> {
            Ok(())
        }

        fn build(&self, _ctx: DriverContext) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
            Box::pin(async { Ok(DeviceComponents::new(Arc::new(Inert))) })
        }
    }

    #[test]
    fn duplicate_registration_is_a_conflict() {
        let registry = DriverRegistry::new();
        registry
            .register(DeviceCategory::Valve, "vici/m6", NamedFactory("first"))
            .unwrap();
        let err = registry
            .register(DeviceCategory::Valve, "vici/m6", NamedFactory("second"))
            .unwrap_err();
        assert!(matches!(err, LabError::DriverConflict { existing, .. } if existing == "first"));
        assert_eq!(
            registry.resolve(DeviceCategory::Valve, "vici/m6").unwrap().name(),
            "first"
        );
    }

    #[test]
    fn override_replaces_explicitly() {
        let registry = DriverRegistry::new();
        registry
            .register(DeviceCategory::Valve, "vici/m6", NamedFactory("first"))
            .unwrap();
        let replaced =
            registry.register_override(DeviceCategory::Valve, "vici/m6", NamedFactory("second"));
        assert_eq!(replaced.as_deref(), Some("first"));
        assert_eq!(
            registry.resolve(DeviceCategory::Valve, "vici/m6").unwrap().name(),
            "second"
        );
    }

    #[test]
    fn same_model_in_another_category_is_distinct() {
        let registry = DriverRegistry::new();
        registry
            .register(DeviceCategory::Valve, "acme/x1", NamedFactory("valve"))
            .unwrap();
        let err = registry
            .resolve(DeviceCategory::Pump, "acme/x1")
            .err()
            .unwrap();
        assert!(matches!(err, LabError::DriverNotFound { .. }));
        assert!(registry.unregister(DeviceCategory::Valve, "acme/x1"));
        assert!(registry.is_empty());
    }
}
