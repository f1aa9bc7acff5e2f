//! Deterministic in-process transport.
//!
//! [`SimulatedTransport`] honours the same contract as the line transports:
//! it must be opened before use, `close` is idempotent and a broken channel
//! fails exchanges with [`LabError::Transport`]. Faults are injected through
//! the shared [`SimulatedConnector`] so tests can make an address
//! unreachable, make the next N opens fail, or cut an open link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Transport, TransportConnector};
use crate::device::ConnectionDescriptor;
use crate::error::{LabError, LabResult};

/// Fault plan for one simulated address.
#[derive(Debug, Clone, Default)]
struct AddressFaults {
    /// Every open attempt fails.
    unreachable: bool,
    /// The next N open attempts fail.
    failing_opens: u32,
    /// Open never completes (exercises the open timeout).
    hang_on_open: bool,
    /// Exchanges fail until the link is re-opened.
    link_down: bool,
}

#[derive(Debug, Default)]
struct SimState {
    faults: DashMap<String, AddressFaults>,
    exchanges: DashMap<String, Vec<String>>,
    opens: AtomicU64,
    closes: AtomicU64,
}

/// Factory for simulated transports with shared fault injection.
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    state: Arc<SimState>,
    latency: Duration,
}

impl SimulatedConnector {
    /// Connector with zero exchange latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fixed latency to each exchange.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every open attempt on `address` fail.
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        self.state
            .faults
            .entry(address.to_string())
            .or_default()
            .unreachable = unreachable;
    }

    /// Fail the next `count` open attempts on `address`.
    pub fn fail_next_opens(&self, address: &str, count: u32) {
        self.state
            .faults
            .entry(address.to_string())
            .or_default()
            .failing_opens = count;
    }

    /// Make opens on `address` hang until cancelled.
    pub fn hang_on_open(&self, address: &str, hang: bool) {
        self.state
            .faults
            .entry(address.to_string())
            .or_default()
            .hang_on_open = hang;
    }

    /// Break (or restore) the link of an open transport.
    pub fn cut_link(&self, address: &str, down: bool) {
        self.state
            .faults
            .entry(address.to_string())
            .or_default()
            .link_down = down;
    }

    /// Requests sent to `address`, oldest first.
    pub fn exchanges(&self, address: &str) -> Vec<String> {
        self.state
            .exchanges
            .get(address)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Total successful opens across all addresses.
    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Total closes of open transports across all addresses.
    pub fn close_count(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }
}

impl TransportConnector for SimulatedConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> LabResult<Box<dyn Transport>> {
        Ok(Box::new(SimulatedTransport {
            address: descriptor.address.clone(),
            open: false,
            latency: self.latency,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Transport backed by the simulator.
#[derive(Debug)]
pub struct SimulatedTransport {
    address: String,
    open: bool,
    latency: Duration,
    state: Arc<SimState>,
}

impl SimulatedTransport {
    fn faults(&self) -> AddressFaults {
        self.state
            .faults
            .get(&self.address)
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> LabResult<()> {
        if self.open {
            return Ok(());
        }
        let faults = self.faults();
        if faults.hang_on_open {
            std::future::pending::<()>().await;
        }
        if faults.unreachable {
            return Err(LabError::TransportUnavailable {
                address: self.address.clone(),
                reason: "simulated device unreachable".to_string(),
            });
        }
        if faults.failing_opens > 0 {
            if let Some(mut f) = self.state.faults.get_mut(&self.address) {
                f.failing_opens -= 1;
            }
            return Err(LabError::TransportUnavailable {
                address: self.address.clone(),
                reason: "simulated open failure".to_string(),
            });
        }
        if let Some(mut f) = self.state.faults.get_mut(&self.address) {
            f.link_down = false;
        }
        self.open = true;
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> LabResult<()> {
        if self.open {
            self.open = false;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &str) -> LabResult<String> {
        if !self.open {
            return Err(LabError::Transport {
                address: self.address.clone(),
                message: "transport not open".to_string(),
            });
        }
        if self.faults().link_down {
            return Err(LabError::Transport {
                address: self.address.clone(),
                message: "simulated link failure".to_string(),
            });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.state
            .exchanges
            .entry(self.address.clone())
            .or_default()
            .push(request.to_string());
        Ok("OK".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(connector: &SimulatedConnector, address: &str) -> Box<dyn Transport> {
        connector
            .connect(&ConnectionDescriptor::simulated(address))
            .unwrap()
    }

    #[tokio::test]
    async fn honours_open_close_contract() {
        let connector = SimulatedConnector::new();
        let mut t = transport(&connector, "pump_1");

        assert!(t.exchange("PING").await.is_err());
        t.open().await.unwrap();
        assert_eq!(t.exchange("PING").await.unwrap(), "OK");
        t.close().await.unwrap();
        t.close().await.unwrap();

        assert_eq!(connector.open_count(), 1);
        assert_eq!(connector.close_count(), 1);
        assert_eq!(connector.exchanges("pump_1"), vec!["PING".to_string()]);
    }

    #[tokio::test]
    async fn injected_open_failures_are_consumed() {
        let connector = SimulatedConnector::new();
        connector.fail_next_opens("valve_1", 2);
        let mut t = transport(&connector, "valve_1");

        assert!(t.open().await.is_err());
        assert!(t.open().await.is_err());
        t.open().await.unwrap();
        assert!(t.is_open());
    }

    #[tokio::test]
    async fn cut_link_fails_exchanges_until_reopen() {
        let connector = SimulatedConnector::new();
        let mut t = transport(&connector, "tc_1");
        t.open().await.unwrap();

        connector.cut_link("tc_1", true);
        let err = t.exchange("TEMP?").await.unwrap_err();
        assert!(err.is_transport());

        t.close().await.unwrap();
        t.open().await.unwrap();
        assert!(t.exchange("TEMP?").await.is_ok());
    }
}
