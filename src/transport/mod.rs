//! Physical and simulated transports.
//!
//! A [`Transport`] is a request/response byte channel to one instrument. The
//! connection manager creates transports through an injectable
//! [`TransportConnector`], so the same engine code runs against serial
//! hardware, TCP terminal servers or the deterministic simulator.

pub mod simulated;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::device::{ConnectionDescriptor, TransportKind};
use crate::error::{LabError, LabResult};

pub use simulated::{SimulatedConnector, SimulatedTransport};
pub use stream::LineTransport;

/// Byte channel to one instrument.
///
/// # Contract
/// - `open` acquires the channel; the caller bounds it with a timeout
/// - `close` is idempotent and always releases the channel
/// - `exchange` on a closed transport fails with [`LabError::Transport`]
#[async_trait]
pub trait Transport: Send + std::fmt::Debug {
    /// Physical address (port path, `host:port`, or simulator name).
    fn address(&self) -> &str;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Acquire the channel.
    async fn open(&mut self) -> LabResult<()>;

    /// Release the channel. Calling it on a closed transport is a no-op.
    async fn close(&mut self) -> LabResult<()>;

    /// Send one request and wait for its reply.
    async fn exchange(&mut self, request: &str) -> LabResult<String>;
}

/// Transport shared between a handle and its driver.
///
/// The mutex serializes exchanges; it is never held across device waits.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Creates (unopened) transports from connection descriptors.
pub trait TransportConnector: Send + Sync {
    /// Build a transport for `descriptor`.
    fn connect(&self, descriptor: &ConnectionDescriptor) -> LabResult<Box<dyn Transport>>;
}

/// Connector for real hardware: TCP and (feature `tokio_serial`) serial lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeConnector;

impl TransportConnector for NativeConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> LabResult<Box<dyn Transport>> {
        match descriptor.kind {
            TransportKind::Tcp => Ok(Box::new(LineTransport::tcp(descriptor))),
            #[cfg(feature = "tokio_serial")]
            TransportKind::Serial => Ok(Box::new(LineTransport::serial(descriptor))),
            #[cfg(not(feature = "tokio_serial"))]
            TransportKind::Serial => Err(LabError::TransportUnavailable {
                address: descriptor.address.clone(),
                reason: "serial support not enabled; rebuild with --features tokio_serial"
                    .to_string(),
            }),
            TransportKind::Simulated => Err(LabError::TransportUnavailable {
                address: descriptor.address.clone(),
                reason: "simulated transports require the simulated connector".to_string(),
            }),
        }
    }
}

/// Dispatches simulated descriptors to a simulator and everything else to
/// native transports.
#[derive(Clone)]
pub struct MixedConnector {
    simulated: SimulatedConnector,
    native: NativeConnector,
}

impl MixedConnector {
    /// Combine a simulator with the native connector.
    pub fn new(simulated: SimulatedConnector) -> Self {
        Self {
            simulated,
            native: NativeConnector,
        }
    }
}

impl TransportConnector for MixedConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> LabResult<Box<dyn Transport>> {
        match descriptor.kind {
            TransportKind::Simulated => self.simulated.connect(descriptor),
            _ => self.native.connect(descriptor),
        }
    }
}

/// Run one exchange on a shared transport.
pub async fn exchange(transport: &SharedTransport, request: &str) -> LabResult<String> {
    transport.lock().await.exchange(request).await
}
