//! Link lifecycle tests for Skylink.
//!
//! Exercises links end to end over the mock transport:
//! - Channel allocation and release across connect/disconnect
//! - Vehicle reference counting and teardown notification
//! - Disconnect racing an in-flight connect
//! - FIFO write ordering under concurrent writers
//! - I/O failures and end of stream
//! - Edge-triggered vehicle liveness

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use skylink::error::Error;
use skylink::link::{ConnectOutcome, Link, LinkConfiguration, LinkEvent};
use skylink::manager::{LinkManager, ManagerConfig};
use skylink::transport::{MockConfig, MockWire, TransportKind};
use skylink::types::{ChannelId, ConnectionState, VehicleId};

// ============================================================================
// Test Infrastructure
// ============================================================================

fn manager_with_pool(channel_pool_size: u8) -> LinkManager {
    LinkManager::new(ManagerConfig {
        channel_pool_size,
        ..ManagerConfig::default()
    })
}

fn mock_link(manager: &LinkManager, name: &str, mock: MockConfig) -> (Arc<Link>, MockWire) {
    let wire = mock.wire.clone();
    let link = manager
        .create_link(LinkConfiguration::new(name, TransportKind::Mock(mock)))
        .unwrap();
    (link, wire)
}

/// Drain events until `deadline` elapses.
async fn collect_events(rx: &mut broadcast::Receiver<LinkEvent>, window: Duration) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        events.push(event);
    }
    events
}

/// Wait for the first event matching `predicate`.
async fn wait_for_event<F>(rx: &mut broadcast::Receiver<LinkEvent>, window: Duration, predicate: F) -> Option<LinkEvent>
where
    F: Fn(&LinkEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        if predicate(&event) {
            return Some(event);
        }
    }
    None
}

async fn wait_until<F: Fn() -> bool>(window: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn count<F: Fn(&LinkEvent) -> bool>(events: &[LinkEvent], predicate: F) -> usize {
    events.iter().filter(|event| predicate(event)).count()
}

// ============================================================================
// Channel allocation and references
// ============================================================================

#[tokio::test]
async fn test_lowest_channel_and_teardown_scenario() {
    let manager = manager_with_pool(16);
    let (link, _wire) = mock_link(&manager, "sim", MockConfig::silent(1));
    let mut events = link.subscribe();

    assert_eq!(link.connect().await.unwrap(), ConnectOutcome::Connected);
    assert_eq!(link.channel(), Some(ChannelId(0)));
    assert!(link.has_channel());
    assert!(manager.allocator().is_assigned(ChannelId(0)));

    link.add_vehicle_reference();
    link.add_vehicle_reference();

    assert_eq!(link.remove_vehicle_reference().unwrap(), 1);
    let early = collect_events(&mut events, Duration::from_millis(50)).await;
    assert_eq!(count(&early, |e| matches!(e, LinkEvent::TeardownRequested)), 0);

    assert_eq!(link.remove_vehicle_reference().unwrap(), 0);
    let teardown = wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, LinkEvent::TeardownRequested)
    })
    .await;
    assert!(teardown.is_some());

    assert!(link.disconnect().await.unwrap());
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(link.channel(), None);
    assert_eq!(link.channel_or_unset(), ChannelId::UNSET);
    assert!(!manager.allocator().is_assigned(ChannelId(0)));
    assert_eq!(manager.allocator().available(), 16);
}

#[tokio::test]
async fn test_reference_underflow_is_reported() {
    let manager = manager_with_pool(4);
    let (link, _wire) = mock_link(&manager, "sim", MockConfig::silent(1));
    let mut events = link.subscribe();

    for _ in 0..3 {
        link.add_vehicle_reference();
    }
    for remaining in (0..3).rev() {
        assert_eq!(link.remove_vehicle_reference().unwrap(), remaining);
    }

    let err = link.remove_vehicle_reference().unwrap_err();
    assert!(matches!(err, Error::ReferenceUnderflow));
    assert!(err.is_defect());
    assert_eq!(link.vehicle_reference_count(), 0);

    let seen = collect_events(&mut events, Duration::from_millis(50)).await;
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::TeardownRequested)), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_of_one_concurrent_connects() {
    let manager = manager_with_pool(1);
    let (a, _wa) = mock_link(&manager, "a", MockConfig::silent(1));
    let (b, _wb) = mock_link(&manager, "b", MockConfig::silent(1));
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let (ra, rb) = tokio::join!(a.connect(), b.connect());

    let (winner, loser, loser_result, loser_events) = match (&ra, &rb) {
        (Ok(ConnectOutcome::Connected), Err(_)) => (&a, &b, rb, &mut b_events),
        (Err(_), Ok(ConnectOutcome::Connected)) => (&b, &a, ra, &mut a_events),
        other => panic!("expected exactly one winner, got {other:?}"),
    };

    assert_eq!(winner.channel(), Some(ChannelId(0)));
    assert!(matches!(loser_result, Err(Error::ChannelExhausted { requested: 1, available: 0 })));
    assert_eq!(loser.state(), ConnectionState::Disconnected);
    assert!(!loser.has_channel());

    let error = wait_for_event(loser_events, Duration::from_secs(1), |e| {
        matches!(e, LinkEvent::CommunicationError { .. })
    })
    .await;
    match error {
        Some(LinkEvent::CommunicationError { message, .. }) => {
            assert!(message.contains("no more vehicle slots available"));
        }
        other => panic!("expected communication error, got {other:?}"),
    }

    winner.disconnect().await.unwrap();
    assert_eq!(manager.allocator().available(), 1);
}

#[tokio::test]
async fn test_mock_link_holds_channel_batch() {
    let manager = manager_with_pool(8);
    let (link, _wire) = mock_link(&manager, "swarm", MockConfig::silent(3));

    link.connect().await.unwrap();
    assert_eq!(link.channels(), vec![ChannelId(0), ChannelId(1), ChannelId(2)]);
    assert_eq!(link.channel(), Some(ChannelId(0)));
    assert_eq!(manager.allocator().available(), 5);

    link.disconnect().await.unwrap();
    assert!(link.channels().is_empty());
    assert_eq!(manager.allocator().available(), 8);
}

#[tokio::test]
async fn test_mock_batch_larger_than_pool_fails() {
    let manager = manager_with_pool(2);
    let (link, wire) = mock_link(&manager, "swarm", MockConfig::silent(3));

    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, Error::ChannelExhausted { requested: 3, available: 2 }));
    assert_eq!(manager.allocator().available(), 2);
    assert_eq!(wire.open_count(), 0);
}

// ============================================================================
// Connect / disconnect
// ============================================================================

#[tokio::test]
async fn test_connect_is_noop_when_active() {
    let manager = manager_with_pool(4);
    let (link, wire) = mock_link(&manager, "sim", MockConfig::silent(1));

    link.connect().await.unwrap();
    assert_eq!(
        link.connect().await.unwrap(),
        ConnectOutcome::AlreadyActive(ConnectionState::Connected)
    );
    assert_eq!(wire.open_count(), 1);
    assert_eq!(manager.allocator().available(), 3);
    link.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_is_idempotent_and_announced_once() {
    let manager = manager_with_pool(4);
    let (link, wire) = mock_link(&manager, "sim", MockConfig::silent(1));
    let mut events = link.subscribe();

    link.connect().await.unwrap();
    let (first, second) = tokio::join!(link.disconnect(), link.disconnect());
    assert!(first.unwrap() ^ second.unwrap());
    assert!(!link.disconnect().await.unwrap());

    let seen = collect_events(&mut events, Duration::from_millis(100)).await;
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::Connected)), 1);
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::Disconnected)), 1);
    assert_eq!(wire.close_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_during_connect() {
    let manager = manager_with_pool(4);
    let mock = MockConfig {
        open_delay: Duration::from_secs(10),
        ..MockConfig::silent(1)
    };
    let (link, wire) = mock_link(&manager, "slow", mock);

    let connecting = Arc::clone(&link);
    let attempt = tokio::spawn(async move { connecting.connect().await });

    link.wait_for_state(ConnectionState::Connecting).await.unwrap();
    assert!(link.has_channel());

    let started = std::time::Instant::now();
    assert!(link.disconnect().await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));

    let result = attempt.await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionAborted)));
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(!link.has_channel());
    assert_eq!(manager.allocator().available(), 4);
    assert_eq!(wire.open_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_racing_connect_never_leaks() {
    let manager = manager_with_pool(2);

    for round in 0..25u64 {
        let mock = MockConfig {
            open_delay: Duration::from_millis(round % 5),
            ..MockConfig::silent(1)
        };
        let (link, _wire) = mock_link(&manager, &format!("race-{round}"), mock);

        let connecting = Arc::clone(&link);
        let attempt = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(round % 3)).await;
        link.disconnect().await.unwrap();
        let _ = attempt.await.unwrap();

        // The connect may have completed before the disconnect ran
        link.disconnect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Disconnected, "round {round}");
        assert!(!link.has_channel(), "round {round}");
        assert_eq!(manager.allocator().available(), 2, "round {round}");
        manager.remove_link(link.id()).unwrap();
    }
}

#[tokio::test]
async fn test_open_failure_rolls_back() {
    let manager = manager_with_pool(4);
    let mock = MockConfig {
        fail_open: true,
        ..MockConfig::silent(1)
    };
    let (link, _wire) = mock_link(&manager, "broken", mock);
    let mut events = link.subscribe();

    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, Error::TransportOpenFailed { .. }));
    assert!(err.is_recoverable());
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(manager.allocator().available(), 4);

    match wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, LinkEvent::CommunicationError { .. })
    })
    .await
    {
        Some(LinkEvent::CommunicationError { title, message }) => {
            assert_eq!(title, "Connection Failed");
            assert!(message.contains("broken"));
        }
        other => panic!("expected communication error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_timeout() {
    let manager = manager_with_pool(4);
    let mock = MockConfig {
        open_delay: Duration::from_secs(30),
        ..MockConfig::silent(1)
    };
    let config = LinkConfiguration::new("stuck", TransportKind::Mock(mock))
        .with_connect_timeout(Duration::from_millis(100));
    let link = manager.create_link(config).unwrap();
    let mut events = link.subscribe();

    let err = link.connect().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionTimeout));
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(manager.allocator().available(), 4);

    let error = wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, LinkEvent::CommunicationError { .. })
    })
    .await;
    assert!(matches!(error, Some(LinkEvent::CommunicationError { title, .. }) if title == "Connection Timeout"));
}

#[tokio::test]
async fn test_reconnect_reuses_lowest_channel() {
    let manager = manager_with_pool(4);
    let (first, _w1) = mock_link(&manager, "first", MockConfig::silent(1));
    let (second, _w2) = mock_link(&manager, "second", MockConfig::silent(1));

    first.connect().await.unwrap();
    second.connect().await.unwrap();
    assert_eq!(second.channel(), Some(ChannelId(1)));

    first.disconnect().await.unwrap();
    first.connect().await.unwrap();
    assert_eq!(first.channel(), Some(ChannelId(0)));

    manager.disconnect_all().await;
    assert_eq!(manager.allocator().available(), 4);
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_write_requires_link_thread() {
    let manager = manager_with_pool(4);
    let (link, _wire) = mock_link(&manager, "sim", MockConfig::silent(1));

    assert!(matches!(link.write_bytes(&b"early"[..]), Err(Error::NotConnected)));

    link.connect().await.unwrap();
    link.write_bytes(&b"ok"[..]).unwrap();
    link.disconnect().await.unwrap();

    assert!(matches!(link.write_bytes(&b"late"[..]), Err(Error::NotConnected)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_are_fifo() {
    const WRITERS: u8 = 8;
    const PER_WRITER: u8 = 50;

    let manager = manager_with_pool(4);
    let (link, wire) = mock_link(&manager, "sim", MockConfig::silent(1));
    link.connect().await.unwrap();

    let mut handles = Vec::new();
    for writer in 0..WRITERS {
        let link = Arc::clone(&link);
        handles.push(tokio::spawn(async move {
            for seq in 0..PER_WRITER {
                link.write_bytes(vec![writer, seq]).unwrap();
                if seq % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let total = usize::from(WRITERS) * usize::from(PER_WRITER);
    assert!(wait_until(Duration::from_secs(5), || wire.written().len() == total).await);

    let mut next = [0u8; WRITERS as usize];
    for chunk in wire.written() {
        assert_eq!(chunk.len(), 2, "buffers must never be split or merged");
        let (writer, seq) = (usize::from(chunk[0]), chunk[1]);
        assert_eq!(seq, next[writer], "writer {writer} reordered");
        next[writer] += 1;
    }
    assert!(next.iter().all(|&n| n == PER_WRITER));

    assert_eq!(link.stats().chunks_sent, total as u64);
    link.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writes_queued_while_connecting_are_flushed() {
    let manager = manager_with_pool(4);
    let mock = MockConfig {
        open_delay: Duration::from_millis(150),
        ..MockConfig::silent(1)
    };
    let (link, wire) = mock_link(&manager, "slow", mock);

    let connecting = Arc::clone(&link);
    let attempt = tokio::spawn(async move { connecting.connect().await });
    link.wait_for_state(ConnectionState::Connecting).await.unwrap();

    link.write_bytes(&b"first"[..]).unwrap();
    link.write_bytes(&b"second"[..]).unwrap();
    assert!(wire.written().is_empty());

    assert_eq!(attempt.await.unwrap().unwrap(), ConnectOutcome::Connected);
    assert!(wait_until(Duration::from_secs(2), || wire.written().len() == 2).await);
    assert_eq!(wire.written_bytes(), b"firstsecond");

    link.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_bytes_sent_and_received_events() {
    let manager = manager_with_pool(4);
    let (link, wire) = mock_link(&manager, "sim", MockConfig::silent(1));
    link.connect().await.unwrap();
    let mut events = link.subscribe();

    link.write_bytes(&b"command"[..]).unwrap();
    let sent = wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, LinkEvent::BytesSent { .. })
    })
    .await;
    match sent {
        Some(LinkEvent::BytesSent { link: id, bytes }) => {
            assert_eq!(id, link.id());
            assert_eq!(&bytes[..], b"command");
        }
        other => panic!("expected BytesSent, got {other:?}"),
    }

    wire.inject(&b"telemetry"[..]);
    let received = wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, LinkEvent::BytesReceived { .. })
    })
    .await;
    assert!(matches!(received, Some(LinkEvent::BytesReceived { bytes, .. }) if &bytes[..] == b"telemetry"));

    let stats = link.stats();
    assert_eq!(stats.bytes_sent, 7);
    assert_eq!(stats.bytes_received, 9);
    link.disconnect().await.unwrap();
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_io_error_disconnects_link() {
    let manager = manager_with_pool(4);
    let (link, wire) = mock_link(&manager, "radio", MockConfig::silent(1));
    link.connect().await.unwrap();
    let mut events = link.subscribe();

    wire.inject_error("cable pulled");

    let seen = collect_until_disconnected(&mut events).await;
    let error_at = seen
        .iter()
        .position(|e| matches!(e, LinkEvent::CommunicationError { .. }))
        .expect("communication error");
    let disconnected_at = seen
        .iter()
        .position(|e| matches!(e, LinkEvent::Disconnected))
        .expect("disconnected");
    assert!(error_at < disconnected_at);

    link.wait_for_state(ConnectionState::Disconnected).await.unwrap();
    assert!(!link.has_channel());
    assert_eq!(manager.allocator().available(), 4);
    assert!(matches!(link.write_bytes(&b"x"[..]), Err(Error::NotConnected)));

    // No automatic retry, but a manual reconnect works
    assert!(!link.disconnect().await.unwrap());
    assert_eq!(link.connect().await.unwrap(), ConnectOutcome::Connected);
    assert_eq!(wire.open_count(), 2);
    link.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_end_of_stream_is_not_an_error() {
    let manager = manager_with_pool(4);
    let (link, wire) = mock_link(&manager, "radio", MockConfig::silent(1));
    link.connect().await.unwrap();
    let mut events = link.subscribe();

    wire.hang_up();

    let seen = collect_until_disconnected(&mut events).await;
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::CommunicationError { .. })), 0);
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::Disconnected)), 1);
    link.wait_for_state(ConnectionState::Disconnected).await.unwrap();
    assert_eq!(manager.allocator().available(), 4);
}

#[tokio::test]
async fn test_link_thread_panic_recovers() {
    let manager = manager_with_pool(4);
    let (link, wire) = mock_link(&manager, "radio", MockConfig::silent(1));
    link.connect().await.unwrap();
    let mut events = link.subscribe();

    wire.inject_panic("decoder bug");

    let seen = collect_until_disconnected(&mut events).await;
    match seen.iter().find(|e| matches!(e, LinkEvent::CommunicationError { .. })) {
        Some(LinkEvent::CommunicationError { message, .. }) => assert!(message.contains("decoder bug")),
        other => panic!("expected communication error, got {other:?}"),
    }
    assert!(matches!(seen.last(), Some(LinkEvent::Disconnected)));

    link.wait_for_state(ConnectionState::Disconnected).await.unwrap();
    assert!(!link.has_channel());
    assert_eq!(manager.allocator().available(), 4);

    assert_eq!(link.connect().await.unwrap(), ConnectOutcome::Connected);
    assert_eq!(wire.open_count(), 2);
    link.disconnect().await.unwrap();
}

async fn collect_until_disconnected(rx: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
    let mut seen = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        let done = matches!(event, LinkEvent::Disconnected);
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

// ============================================================================
// Liveness
// ============================================================================

fn liveness_config(name: &str, mock: MockConfig) -> LinkConfiguration {
    LinkConfiguration::new(name, TransportKind::Mock(mock))
        .persistent()
        .with_liveness_timeout(Duration::from_millis(200))
        .with_liveness_check_interval(Duration::from_millis(25))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_liveness_lost_and_regained_once() {
    let manager = manager_with_pool(4);
    let mock = MockConfig::silent(1);
    let wire = mock.wire.clone();
    let link = manager.create_link(liveness_config("sim", mock)).unwrap();
    let mut events = link.subscribe();

    link.attach_vehicle(VehicleId(1));
    link.connect().await.unwrap();

    // One unbroken silence well past the timeout
    let silence = collect_events(&mut events, Duration::from_millis(700)).await;
    assert_eq!(count(&silence, |e| matches!(e, LinkEvent::VehicleLinkLost(VehicleId(1)))), 1);
    assert_eq!(count(&silence, |e| matches!(e, LinkEvent::VehicleLinkRegained(_))), 0);

    wire.inject_heartbeat(1, 0).unwrap();
    let regained = wait_for_event(&mut events, Duration::from_secs(1), |e| {
        matches!(e, LinkEvent::VehicleLinkRegained(_))
    })
    .await;
    assert!(matches!(regained, Some(LinkEvent::VehicleLinkRegained(VehicleId(1)))));
    assert!(link.decoded_first_frame());

    // Steady traffic keeps the vehicle alive
    for seq in 1..8u8 {
        wire.inject_heartbeat(1, seq).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let steady = collect_events(&mut events, Duration::from_millis(20)).await;
    assert_eq!(count(&steady, |e| matches!(e, LinkEvent::VehicleLinkLost(_))), 0);
    assert_eq!(count(&steady, |e| matches!(e, LinkEvent::VehicleLinkRegained(_))), 0);

    link.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_liveness_dormant_without_vehicles() {
    let manager = manager_with_pool(4);
    let link = manager
        .create_link(liveness_config("idle", MockConfig::silent(1)))
        .unwrap();
    let mut events = link.subscribe();

    link.connect().await.unwrap();
    let seen = collect_events(&mut events, Duration::from_millis(500)).await;
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::VehicleLinkLost(_))), 0);
    link.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auxiliary_link_has_no_liveness() {
    let manager = manager_with_pool(4);
    let config = liveness_config("flow", MockConfig::silent(1)).auxiliary();
    let link = manager.create_link(config).unwrap();
    assert!(link.is_auxiliary());
    let mut events = link.subscribe();

    link.attach_vehicle(VehicleId(1));
    link.connect().await.unwrap();

    let seen = collect_events(&mut events, Duration::from_millis(500)).await;
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::VehicleLinkLost(_))), 0);
    link.disconnect().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detached_vehicle_is_not_tracked() {
    let manager = manager_with_pool(4);
    let link = manager
        .create_link(liveness_config("sim", MockConfig::silent(2)))
        .unwrap();
    let mut events = link.subscribe();

    link.attach_vehicle(VehicleId(1));
    link.attach_vehicle(VehicleId(2));
    link.connect().await.unwrap();
    link.detach_vehicle(VehicleId(2)).unwrap();

    let seen = collect_events(&mut events, Duration::from_millis(600)).await;
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::VehicleLinkLost(VehicleId(1)))), 1);
    assert_eq!(count(&seen, |e| matches!(e, LinkEvent::VehicleLinkLost(VehicleId(2)))), 0);
    link.disconnect().await.unwrap();
}
