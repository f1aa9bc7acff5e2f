//! Connection manager lifecycle tests
//!
//! Open/close idempotence, exclusive address claims, open timeouts, link
//! loss, bounded reconnect and the telemetry poller, all against the
//! simulated transport.

use std::sync::Arc;
use std::time::Duration;

use autolab::bus::{EventBus, EventKind};
use autolab::connection::{ConnectionManager, ConnectionSettings};
use autolab::device::{
    Capability, ConnectionDescriptor, DeviceCategory, DeviceSpec, HandleState, Operation,
};
use autolab::drivers::register_simulated_drivers;
use autolab::registry::DriverRegistry;
use autolab::transport::SimulatedConnector;
use autolab::LabError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn manager() -> (ConnectionManager, SimulatedConnector, EventBus) {
    let registry = Arc::new(DriverRegistry::new());
    register_simulated_drivers(&registry).unwrap();
    let sim = SimulatedConnector::new();
    let bus = EventBus::new();
    let manager = ConnectionManager::new(
        ConnectionSettings::default(),
        Arc::new(sim.clone()),
        registry,
        bus.clone(),
    );
    (manager, sim, bus)
}

fn valve(id: &str) -> DeviceSpec {
    DeviceSpec::simulated(DeviceCategory::Valve, "selector", id)
}

fn select(position: u32) -> Operation {
    Operation::SelectPosition { position }
}

// =============================================================================
// Open / close
// =============================================================================

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_releases_the_address() {
    let (manager, sim, _bus) = manager();

    let handle = manager.open(valve("v1")).await.unwrap();
    assert_eq!(handle.state(), HandleState::Ready);
    assert!(manager.is_claimed("sim://v1"));

    manager.close(&handle).await.unwrap();
    manager.close(&handle).await.unwrap();
    assert_eq!(handle.state(), HandleState::Disconnected);
    assert!(!manager.is_claimed("sim://v1"));
    assert!(manager.handle("v1").is_none());
    assert_eq!(sim.close_count(), 1);

    // A closed handle refuses work.
    let err = handle
        .execute(&select(2), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::DeviceUnavailable { .. }));

    // The address can be opened again.
    let reopened = manager.open(valve("v1")).await.unwrap();
    assert_eq!(reopened.state(), HandleState::Ready);
}

#[tokio::test(start_paused = true)]
async fn second_open_of_an_address_is_refused() {
    let (manager, _sim, _bus) = manager();

    let first = manager.open(valve("v1")).await.unwrap();
    let alias = valve("v2").with_connection(ConnectionDescriptor::simulated("v1"));

    let err = manager.open(alias.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        LabError::AddressInUse { ref holder, .. } if holder == "v1"
    ));

    manager.close(&first).await.unwrap();
    let second = manager.open(alias).await.unwrap();
    assert_eq!(second.id(), "v2");
}

#[tokio::test(start_paused = true)]
async fn concurrent_opens_of_one_id_admit_exactly_one() {
    let (manager, _sim, _bus) = manager();

    let at_a = valve("v1").with_connection(ConnectionDescriptor::simulated("a"));
    let at_b = valve("v1").with_connection(ConnectionDescriptor::simulated("b"));
    let (first, second) = tokio::join!(manager.open(at_a), manager.open(at_b));

    let (winner, loser) = match (first, second) {
        (Ok(handle), Err(err)) | (Err(err), Ok(handle)) => (handle, err),
        (Ok(_), Ok(_)) => panic!("both opens of 'v1' succeeded"),
        (Err(a), Err(b)) => panic!("both opens failed: {a}; {b}"),
    };
    assert!(matches!(loser, LabError::Configuration(ref m) if m.contains("'v1'")));
    assert_eq!(manager.handles().len(), 1);
    assert!(manager.handle("v1").unwrap().same_as(&winner));

    // Only the winner's address stays claimed.
    let winner_key = winner.spec().connection.claim_key();
    for key in ["sim://a", "sim://b"] {
        assert_eq!(manager.is_claimed(key), key == winner_key, "{key}");
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_driver_is_reported_without_claiming() {
    let (manager, _sim, _bus) = manager();

    let spec = DeviceSpec::simulated(DeviceCategory::Pump, "hplc_9000", "p1");
    let err = manager.open(spec).await.unwrap_err();

    assert!(matches!(
        err,
        LabError::DriverNotFound { ref vendor_model, .. } if vendor_model == "sim/hplc_9000"
    ));
    assert!(!manager.is_claimed("sim://p1"));
}

#[tokio::test(start_paused = true)]
async fn required_capability_must_be_offered() {
    let (manager, _sim, _bus) = manager();

    let spec = DeviceSpec::simulated(DeviceCategory::Pump, "peristaltic", "p1")
        .requiring([Capability::Dispense, Capability::Aspirate]);
    let err = manager.open(spec).await.unwrap_err();

    assert!(matches!(
        err,
        LabError::Unsupported { ref capability, .. } if capability == "aspirate"
    ));
}

#[tokio::test(start_paused = true)]
async fn unreachable_device_fails_open_and_frees_the_claim() {
    let (manager, sim, _bus) = manager();
    sim.set_unreachable("v1", true);

    let err = manager.open(valve("v1")).await.unwrap_err();
    assert!(matches!(err, LabError::TransportUnavailable { .. }));
    assert!(!manager.is_claimed("sim://v1"));
    assert!(manager.handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hanging_open_is_bounded_by_the_open_timeout() {
    let (manager, sim, _bus) = manager();
    sim.hang_on_open("v1", true);

    let started = Instant::now();
    let err = manager.open(valve("v1")).await.unwrap_err();

    assert!(matches!(err, LabError::TransportUnavailable { .. }));
    assert_eq!(
        started.elapsed(),
        manager.settings().open_timeout,
        "open must give up exactly at the timeout"
    );
}

// =============================================================================
// Link loss and reconnect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn link_loss_faults_the_handle_until_reconnected() {
    let (manager, sim, _bus) = manager();
    let handle = manager.open(valve("v1")).await.unwrap();
    let cancel = CancellationToken::new();

    sim.cut_link("v1", true);
    let err = handle.execute(&select(2), &cancel).await.unwrap_err();
    assert!(err.is_transport());
    assert_eq!(handle.state(), HandleState::Faulted);

    let err = handle.execute(&select(2), &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        LabError::DeviceUnavailable {
            state: HandleState::Faulted,
            ..
        }
    ));

    // Re-opening restores the link.
    manager.reconnect(&handle).await.unwrap();
    assert_eq!(handle.state(), HandleState::Ready);
    handle.execute(&select(2), &cancel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_the_configured_attempts() {
    let (manager, sim, _bus) = manager();
    let handle = manager.open(valve("v1")).await.unwrap();
    sim.set_unreachable("v1", true);

    let started = Instant::now();
    let err = manager.reconnect(&handle).await.unwrap_err();

    let policy = &manager.settings().reconnect;
    assert!(matches!(
        err,
        LabError::ReconnectExhausted { attempts, .. } if attempts == policy.max_attempts
    ));
    assert_eq!(handle.state(), HandleState::Faulted);
    // 250 ms + 500 ms + 1 s + 2 s between five attempts.
    let expected: Duration = (1..policy.max_attempts)
        .map(|n| policy.delay_for_attempt(n))
        .sum();
    assert_eq!(started.elapsed(), expected);

    sim.set_unreachable("v1", false);
    manager.recover(&handle).await.unwrap();
    assert_eq!(handle.state(), HandleState::Ready);
}

#[tokio::test(start_paused = true)]
async fn reconnect_survives_transient_open_failures() {
    let (manager, sim, _bus) = manager();
    let handle = manager.open(valve("v1")).await.unwrap();
    let opens_before = sim.open_count();

    sim.fail_next_opens("v1", 2);
    manager.reconnect(&handle).await.unwrap();

    assert_eq!(handle.state(), HandleState::Ready);
    assert_eq!(sim.open_count(), opens_before + 1);
}

#[tokio::test(start_paused = true)]
async fn deregister_closes_the_device() {
    let (manager, _sim, _bus) = manager();
    manager.register(valve("v1")).unwrap();
    assert!(manager.register(valve("v1")).is_err());

    let handle = manager.open_registered("v1").await.unwrap();
    assert!(manager.deregister("v1").await.unwrap());
    assert_eq!(handle.state(), HandleState::Disconnected);
    assert!(manager.registered().is_empty());
    assert!(!manager.deregister("v1").await.unwrap());
}

// =============================================================================
// Events and telemetry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn state_transitions_are_published() {
    let (manager, _sim, bus) = manager();
    let mut events = bus.subscribe();

    let handle = manager.open(valve("v1")).await.unwrap();
    handle
        .execute(&select(3), &CancellationToken::new())
        .await
        .unwrap();
    manager.close(&handle).await.unwrap();

    let transitions: Vec<(HandleState, HandleState)> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::DeviceState { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        [
            (HandleState::Disconnected, HandleState::Connecting),
            (HandleState::Connecting, HandleState::Ready),
            (HandleState::Ready, HandleState::Busy),
            (HandleState::Busy, HandleState::Ready),
            (HandleState::Ready, HandleState::Disconnected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_open_returns_to_disconnected() {
    let (manager, sim, bus) = manager();
    let mut events = bus.subscribe();
    sim.set_unreachable("v1", true);

    manager.open(valve("v1")).await.unwrap_err();

    let transitions: Vec<(HandleState, HandleState)> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e.kind {
            EventKind::DeviceState { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        [
            (HandleState::Disconnected, HandleState::Connecting),
            (HandleState::Connecting, HandleState::Disconnected),
        ]
    );

    // The id is free again once the open has failed.
    sim.set_unreachable("v1", false);
    manager.open(valve("v1")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn telemetry_poller_publishes_until_close() {
    let (manager, _sim, bus) = manager();
    let mut events = bus.subscribe();

    let spec = valve("v1").with_telemetry_interval(Duration::from_secs(1));
    let handle = manager.open(spec).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    manager.close(&handle).await.unwrap();

    let samples = |events: Vec<Arc<autolab::bus::Event>>| {
        events
            .iter()
            .filter(|e| matches!(&e.kind, EventKind::Telemetry(t) if t.field == "position"))
            .count()
    };
    let polled = samples(events.drain());
    assert!((3..=5).contains(&polled), "{polled} samples");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(samples(events.drain()), 0);
}
