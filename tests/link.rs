//! End-to-end behaviour of `DeviceLink` against the in-memory platform.
//!
//! Every test runs on a paused tokio clock, so the 15 s scan window and the
//! 2 s reconnect back-off elapse instantly but in order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use halofit_link::mock::{MockPlatform, MockRadio};
use halofit_link::platform::ServiceInfo;
use halofit_link::protocol::RECONNECT_DELAY;
use halofit_link::prelude::*;

async fn next_event(rx: &mut UnboundedReceiver<LinkEvent>) -> LinkEvent {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("no event within 120 s")
        .expect("event channel closed")
}

async fn connected(
    platform: &MockPlatform,
) -> (DeviceLink<MockPlatform>, UnboundedReceiver<LinkEvent>) {
    connected_with(platform, LinkConfig::default()).await
}

async fn connected_with(
    platform: &MockPlatform,
    config: LinkConfig,
) -> (DeviceLink<MockPlatform>, UnboundedReceiver<LinkEvent>) {
    let link = DeviceLink::new(platform.clone(), config);
    let mut rx = link.events();
    assert!(link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(true));
    (link, rx)
}

/// Let spawned release tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn cancelled() -> LinkError {
    LinkError::Cancelled("Operation was cancelled".into())
}

/// `MockPlatform` whose every radio after the first takes a second to open.
struct SlowReopen {
    inner: MockPlatform,
    opened: AtomicUsize,
}

#[async_trait]
impl Platform for SlowReopen {
    type Radio = MockRadio;

    async fn request_permissions(&self) -> bool {
        self.inner.request_permissions().await
    }

    async fn open_radio(&self) -> Result<MockRadio, LinkError> {
        if self.opened.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.inner.open_radio().await
    }
}

// ── Establishment ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reports_active_only_once_subscribed() {
    let platform = MockPlatform::new();
    let (link, _rx) = connected(&platform).await;

    assert!(link.is_connected());
    assert_eq!(link.state(), ConnectionState::Active);
    let counters = platform.counters();
    assert_eq!(counters.radios_opened, 1);
    assert_eq!(counters.scans_started, 1);
    assert_eq!(counters.scans_stopped, 1);
    assert_eq!(counters.connects, 1);
    assert_eq!(counters.subscribes, 1);
}

#[tokio::test(start_paused = true)]
async fn discovery_timeout_reports_failure_and_holds_nothing() {
    let platform = MockPlatform::new().with_advertisements([Some("Other Band"), None]);
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let mut rx = link.events();

    let started = Instant::now();
    assert!(link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));

    assert!(started.elapsed() >= SCAN_TIMEOUT);
    assert!(!link.is_connected());
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(matches!(
        link.last_failure(),
        Some(LinkError::DiscoveryTimeout { .. })
    ));
    let counters = platform.counters();
    assert_eq!(counters.scans_stopped, 1);
    assert_eq!(counters.connects, 0);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_is_not_initiated() {
    let platform = MockPlatform::new().without_permission();
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let mut rx = link.events();

    assert!(!link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    assert_eq!(link.last_failure(), Some(LinkError::PermissionDenied));
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(platform.counters().scans_started, 0);

    // Manual retry once permission is granted.
    platform.set_permission(true);
    assert!(link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(true));
    assert_eq!(link.last_failure(), None);
}

#[tokio::test(start_paused = true)]
async fn radio_off_is_not_initiated() {
    let platform = MockPlatform::new().with_radio_state(RadioState::PoweredOff);
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let mut rx = link.events();

    assert!(!link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    assert_eq!(
        link.last_failure(),
        Some(LinkError::RadioUnavailable(RadioState::PoweredOff))
    );
    assert_eq!(platform.counters().scans_started, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_service_is_diagnosed() {
    let platform = MockPlatform::new().with_services(vec![ServiceInfo {
        uuid: uuid::Uuid::from_u128(0x180d),
        characteristics: vec![uuid::Uuid::from_u128(0x2a37)],
    }]);
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let mut rx = link.events();

    assert!(link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    assert_eq!(link.last_failure(), Some(LinkError::ServiceNotFound(SERVICE_UUID)));
    assert!(!link.is_connected());
    let counters = platform.counters();
    assert_eq!(counters.subscribes, 0);
    assert_eq!(counters.disconnects, 1);
}

// ── Decode pipeline ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn samples_arrive_in_order_without_ignored_payloads() {
    let platform = MockPlatform::new();
    let (_link, mut rx) = connected(&platform).await;

    for payload in [
        "BPM: 80 | Cal:57.11 kcal | Steps:  262",
        "",
        "Battery: 87%",
        "HR:81,CAL:57.2",
        "\n",
        "garbage!!",
        r#"{"heartRate":82,"calories":57.3,"stepCount":270}"#,
        "   ",
        r#"{"hr":83,"cal":57.4,"steps":275}"#,
    ] {
        assert!(platform.notify(payload.as_bytes()));
    }

    let mut samples = Vec::new();
    while samples.len() < 4 {
        match next_event(&mut rx).await {
            LinkEvent::Sample(s) => samples.push(s),
            other => panic!("unexpected {other:?}"),
        }
    }
    let heart_rates: Vec<u32> = samples.iter().map(|s| s.heart_rate).collect();
    assert_eq!(heart_rates, [80, 81, 82, 83]);
    assert_eq!(samples[0].calories, 57.11);
    assert_eq!(samples[0].step_count, 262);
    assert_eq!(samples[1].step_count, 0);
    assert!(samples.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn base64_payloads_are_decoded_when_configured() {
    let platform = MockPlatform::new();
    let config = LinkConfig {
        payload_encoding: PayloadEncoding::Base64,
        ..LinkConfig::default()
    };
    let (_link, mut rx) = connected_with(&platform, config).await;

    platform.notify(b"Cg==");
    platform.notify(b"%%%");
    platform.notify(b"QlBNOiA4MCB8IENhbDo1Ny4xMSBrY2FsIHwgU3RlcHM6ICAyNjI=");

    match next_event(&mut rx).await {
        LinkEvent::Sample(s) => {
            assert_eq!((s.heart_rate, s.calories, s.step_count), (80, 57.11, 262));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn last_data_registration_wins() {
    let platform = MockPlatform::new();
    let (link, _rx) = connected(&platform).await;

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&first);
    link.on_data(move |s| sink.lock().unwrap().push(s.heart_rate));
    let sink = Arc::clone(&second);
    link.on_data(move |s| sink.lock().unwrap().push(s.heart_rate));

    platform.notify(b"BPM: 90");
    settle().await;
    assert!(first.lock().unwrap().is_empty());
    assert_eq!(*second.lock().unwrap(), [90]);
}

// ── Commands ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn commands_need_an_active_link() {
    let platform = MockPlatform::new();
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    assert_eq!(link.send_command("start").await, Err(LinkError::NotConnected));

    let mut rx = link.events();
    assert!(link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(true));
    link.send_command("start").await.unwrap();
    link.send_command("rate 1\r\n").await.unwrap();
    assert_eq!(
        platform.counters().writes,
        vec![b"start\n".to_vec(), b"rate 1\n".to_vec()]
    );
}

// ── Disconnect ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn disconnect_twice_reports_once() {
    let platform = MockPlatform::new();
    let (link, mut rx) = connected(&platform).await;

    link.disconnect().await;
    link.disconnect().await;
    settle().await;

    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    assert!(rx.try_recv().is_err());
    assert!(!link.is_connected());
    assert_eq!(link.state(), ConnectionState::Disconnected);
    let counters = platform.counters();
    assert_eq!(counters.unsubscribes, 1);
    assert_eq!(counters.disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_idle_is_silent() {
    let platform = MockPlatform::new();
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let mut rx = link.events();

    link.disconnect().await;
    settle().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(link.state(), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_scan_stops_it_and_suppresses_the_timeout() {
    let platform = MockPlatform::new().with_no_advertisements();
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let mut rx = link.events();

    assert!(link.connect().await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    link.disconnect().await;
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));

    tokio::time::sleep(SCAN_TIMEOUT * 2).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(link.last_failure(), None);
    assert_eq!(platform.counters().scans_stopped, 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_from_inside_a_connection_callback() {
    let platform = MockPlatform::new();
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let data_tx = tx.clone();
    link.on_data(move |sample| {
        let _ = data_tx.send(LinkEvent::Sample(sample));
    });
    let handle = link.clone();
    link.on_connection_change(move |up| {
        let _ = tx.send(LinkEvent::Connection(up));
        if up {
            let handle = handle.clone();
            tokio::spawn(async move { handle.disconnect().await });
        }
    });

    assert!(link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(true));
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));

    assert!(!platform.notify(b"BPM: 90"));
    settle().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(link.state(), ConnectionState::Disconnected);
    let counters = platform.counters();
    assert_eq!(counters.unsubscribes, 1);
    assert_eq!(counters.disconnects, 1);
}

// ── Recovery ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancellation_recreates_radio_and_reconnects_once() {
    let platform = MockPlatform::new();
    let (link, mut rx) = connected(&platform).await;

    platform.fail_subscription(cancelled());
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    let lost_at = Instant::now();
    assert!(!link.is_connected());
    assert!(link.reconnect_pending());
    let counters = platform.counters();
    assert_eq!(counters.radios_shut_down, 1);
    assert_eq!(counters.radios_opened, 2);
    assert_eq!(counters.disconnects, 1);

    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(true));
    assert!(lost_at.elapsed() >= RECONNECT_DELAY);
    assert!(link.is_connected());

    tokio::time::sleep(Duration::from_secs(30)).await;
    let counters = platform.counters();
    assert_eq!(counters.connects, 2);
    assert_eq!(counters.radios_opened, 2);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn cancelled_attempt_recreates_radio_and_retries_once() {
    let platform = MockPlatform::new().failing_connect(cancelled());
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    let mut rx = link.events();

    assert!(link.connect().await);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    let failed_at = Instant::now();
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(link.last_failure(), Some(cancelled()));
    assert!(link.reconnect_pending());
    let counters = platform.counters();
    assert_eq!(counters.radios_shut_down, 1);
    assert_eq!(counters.radios_opened, 2);

    platform.set_connect_failure(None);
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(true));
    assert!(failed_at.elapsed() >= RECONNECT_DELAY);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    let counters = platform.counters();
    assert_eq!(counters.connects, 2);
    assert_eq!(counters.radios_opened, 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_the_radio_is_recreated_still_reports_once() {
    let mock = MockPlatform::new().failing_connect(cancelled());
    let platform = SlowReopen {
        inner: mock.clone(),
        opened: AtomicUsize::new(0),
    };
    let link = DeviceLink::new(platform, LinkConfig::default());
    let mut rx = link.events();

    assert!(link.connect().await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(rx.try_recv().is_err());

    link.disconnect().await;
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    assert!(!link.reconnect_pending());
    assert_eq!(mock.counters().connects, 1);
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn disconnect_before_backoff_cancels_the_reconnect() {
    let platform = MockPlatform::new();
    let (link, mut rx) = connected(&platform).await;

    platform.fail_subscription(cancelled());
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));

    tokio::time::sleep(Duration::from_millis(500)).await;
    link.disconnect().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(platform.counters().connects, 1);
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn peripheral_drop_is_reported_without_reconnect() {
    let platform = MockPlatform::new();
    let (link, mut rx) = connected(&platform).await;

    assert!(platform.drop_link());
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    assert_eq!(link.last_failure(), Some(LinkError::LinkLost));
    assert!(!link.reconnect_pending());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    let counters = platform.counters();
    assert_eq!(counters.connects, 1);
    assert_eq!(counters.radios_opened, 1);
}

#[tokio::test(start_paused = true)]
async fn subscription_error_ends_the_session() {
    let platform = MockPlatform::new();
    let (link, mut rx) = connected(&platform).await;

    platform.fail_subscription(LinkError::Platform("GATT error 0x85".into()));
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(
        link.last_failure(),
        Some(LinkError::Platform("GATT error 0x85".into()))
    );
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(platform.counters().connects, 1);
}

#[tokio::test(start_paused = true)]
async fn opt_in_reconnect_after_peripheral_drop() {
    let platform = MockPlatform::new();
    let config = LinkConfig {
        reconnect_on_link_loss: true,
        ..LinkConfig::default()
    };
    let (link, mut rx) = connected_with(&platform, config).await;

    platform.drop_link();
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(true));
    assert!(link.is_connected());
    let counters = platform.counters();
    assert_eq!(counters.connects, 2);
    assert_eq!(counters.radios_opened, 1);
}

// ── Destroy ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn destroy_releases_everything_once_and_goes_silent() {
    let platform = MockPlatform::new();
    let (link, mut rx) = connected(&platform).await;

    link.destroy();
    link.destroy();
    settle().await;

    assert!(rx.recv().await.is_none());
    assert!(!link.is_connected());
    assert!(!link.connect().await);
    link.disconnect().await;
    assert!(!platform.notify(b"BPM: 99"));

    let counters = platform.counters();
    assert_eq!(counters.unsubscribes, 1);
    assert_eq!(counters.disconnects, 1);
    assert_eq!(counters.radios_shut_down, 1);
    assert_eq!(counters.connects, 1);
}

#[tokio::test(start_paused = true)]
async fn destroy_before_any_connect_is_harmless() {
    let platform = MockPlatform::new();
    let link = DeviceLink::new(platform.clone(), LinkConfig::default());
    link.destroy();
    settle().await;
    assert_eq!(platform.counters(), Default::default());
}

#[tokio::test(start_paused = true)]
async fn destroy_from_inside_a_data_callback() {
    let platform = MockPlatform::new();
    let (link, _rx) = connected(&platform).await;

    let seen = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&seen);
    let handle = link.clone();
    link.on_data(move |_| {
        *sink.lock().unwrap() += 1;
        handle.destroy();
    });

    platform.notify(b"BPM: 70");
    platform.notify(b"BPM: 71");
    settle().await;

    assert_eq!(*seen.lock().unwrap(), 1);
    assert_eq!(platform.counters().radios_shut_down, 1);
}

#[tokio::test(start_paused = true)]
async fn destroy_during_backoff_cancels_the_reconnect() {
    let platform = MockPlatform::new();
    let (link, mut rx) = connected(&platform).await;

    platform.fail_subscription(LinkError::Cancelled("operation canceled".into()));
    assert_eq!(next_event(&mut rx).await, LinkEvent::Connection(false));
    link.destroy();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let counters = platform.counters();
    assert_eq!(counters.connects, 1);
    // The original radio during recovery, the recreated one on destroy.
    assert_eq!(counters.radios_shut_down, 2);
}
