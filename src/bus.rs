//! Event/Telemetry Bus
//!
//! In-process publish/subscribe point for device state changes, measurements,
//! step/run transitions and safety trips.
//!
//! ```text
//!  DeviceHandle ──┐                      ┌──▶ SafetyMonitor
//!  MethodEngine ──┼──▶ EventBus::publish ─┼──▶ CsvRecorder
//!  SafetyMonitor ─┘   (per-subscriber     └──▶ GUI / logging collaborators
//!                      unbounded queue)
//! ```
//!
//! Each subscriber owns an unbounded queue, so a slow consumer never loses
//! events (at-least-once delivery). Events from one publisher reach every
//! subscriber in publication order; there is no ordering across publishers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::device::{DeviceCategory, DeviceId, HandleState};
use crate::engine::{RunId, RunStatus, StepStatus};
use crate::safety::SafetyAction;

/// Measurement published by a driver or the telemetry poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Category of the publishing device.
    pub category: DeviceCategory,
    /// Instance id of the publishing device.
    pub device_id: DeviceId,
    /// Field name, e.g. `"temperature"` or `"pressure"`.
    pub field: String,
    /// Measured value.
    pub value: f64,
    /// Unit label.
    pub unit: String,
}

/// Payload of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Device measurement.
    Telemetry(Telemetry),
    /// Device handle state transition.
    DeviceState {
        /// Device instance id.
        device_id: DeviceId,
        /// Previous state.
        from: HandleState,
        /// New state.
        to: HandleState,
    },
    /// Run status transition.
    RunStatus {
        /// Run id.
        run_id: RunId,
        /// Method name.
        method: String,
        /// New status.
        status: RunStatus,
    },
    /// Step status transition.
    StepStatus {
        /// Run id.
        run_id: RunId,
        /// Step id.
        step: String,
        /// New status.
        status: StepStatus,
        /// Failure description for failed or aborted steps.
        detail: Option<String>,
    },
    /// All members of a parallel group reached a terminal state.
    GroupCompleted {
        /// Run id.
        run_id: RunId,
        /// Group name.
        group: String,
    },
    /// A safety rule tripped.
    SafetyTrip {
        /// Rule name.
        rule: String,
        /// Device that reported the offending value.
        device_id: DeviceId,
        /// Telemetry field.
        field: String,
        /// Offending value.
        value: f64,
        /// Action taken.
        action: SafetyAction,
    },
}

impl EventKind {
    /// Short name used by recorders.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Telemetry(_) => "telemetry",
            EventKind::DeviceState { .. } => "device_state",
            EventKind::RunStatus { .. } => "run_status",
            EventKind::StepStatus { .. } => "step_status",
            EventKind::GroupCompleted { .. } => "group_completed",
            EventKind::SafetyTrip { .. } => "safety_trip",
        }
    }
}

/// Envelope of every bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Bus-wide publication sequence number.
    pub seq: u64,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Publisher name (device id, `"engine"`, `"safety"`).
    pub source: String,
    /// Payload.
    pub kind: EventKind,
}

struct BusInner {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<Arc<Event>>>>,
    seq: AtomicU64,
}

/// Cheaply cloneable handle to the bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber. It receives every event published afterwards.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.write().push(tx);
        Subscription { rx }
    }

    /// Publish an event to every live subscriber.
    ///
    /// The subscriber list lock is held while sending so two events from the
    /// same publisher cannot be interleaved in the opposite order.
    pub fn publish(&self, source: impl Into<String>, kind: EventKind) {
        let source = source.into();
        let mut prune = false;
        {
            let subscribers = self.inner.subscribers.read();
            let event = Arc::new(Event {
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                timestamp: Utc::now(),
                source,
                kind,
            });
            for tx in subscribers.iter() {
                if tx.send(Arc::clone(&event)).is_err() {
                    prune = true;
                }
            }
        }
        if prune {
            self.inner.subscribers.write().retain(|tx| !tx.is_closed());
        }
    }

    /// Publish a telemetry event on behalf of a device.
    pub fn publish_telemetry(&self, telemetry: Telemetry) {
        let source = telemetry.device_id.clone();
        self.publish(source, EventKind::Telemetry(telemetry));
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Arc<Event>>,
}

impl Subscription {
    /// Next event, or `None` once every bus handle is gone.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued right now.
    pub fn drain(&mut self) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Telemetry publisher handed to drivers.
#[derive(Clone, Debug)]
pub struct TelemetrySink {
    bus: EventBus,
    category: DeviceCategory,
    device_id: DeviceId,
}

impl TelemetrySink {
    /// Sink publishing on behalf of one device.
    pub fn new(bus: EventBus, category: DeviceCategory, device_id: impl Into<DeviceId>) -> Self {
        Self {
            bus,
            category,
            device_id: device_id.into(),
        }
    }

    /// Publish one measurement.
    pub fn publish(&self, field: &str, value: f64, unit: &str) {
        self.bus.publish_telemetry(Telemetry {
            category: self.category,
            device_id: self.device_id.clone(),
            field: field.to_string(),
            value,
            unit: unit.to_string(),
        });
    }

    /// Device this sink publishes for.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(value: f64) -> Telemetry {
        Telemetry {
            category: DeviceCategory::TemperatureController,
            device_id: "tc1".into(),
            field: "temperature".into(),
            value,
            unit: "degC".into(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        for i in 0..100 {
            bus.publish_telemetry(reading(f64::from(i)));
        }

        for sub in [&mut a, &mut b] {
            let events = sub.drain();
            assert_eq!(events.len(), 100);
            for (i, event) in events.iter().enumerate() {
                match &event.kind {
                    EventKind::Telemetry(t) => assert_eq!(t.value, i as f64),
                    other => panic!("unexpected event {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        let _keep = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(sub);
        bus.publish_telemetry(reading(1.0));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn sink_stamps_device_identity() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let sink = TelemetrySink::new(bus.clone(), DeviceCategory::Pump, "pump_1");
        sink.publish("pressure", 1.5, "bar");

        let event = sub.recv().await.unwrap();
        assert_eq!(event.source, "pump_1");
        match &event.kind {
            EventKind::Telemetry(t) => {
                assert_eq!(t.category, DeviceCategory::Pump);
                assert_eq!(t.field, "pressure");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
