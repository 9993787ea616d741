mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use socketshuttle::transport::{FailureKind, TransportEvents};
use socketshuttle::{
    CloseCode, ConnectCondition, ErrorReason, InterfaceType, ManualReachability, SendError,
    Shuttle, ShuttleConfig, SocketState,
};
use std::time::Duration;

const INTERFACES: [InterfaceType; 3] = [
    InterfaceType::None,
    InterfaceType::Cellular,
    InterfaceType::Wifi,
];

#[tokio::test(start_paused = true)]
async fn random_event_sequences_keep_timer_and_state_consistent() {
    for seed in 0..20 {
        run_sequence(seed).await;
    }
}

async fn run_sequence(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (transport, mut calls) = mock_transport();
    let (observer, mut notifications) = recorder();
    let reachability = ManualReachability::new(InterfaceType::Wifi);
    let (shuttle, _) = Shuttle::create(
        ShuttleConfig::new("ws://127.0.0.1:9001").timeout(Duration::from_secs(10)),
        transport,
        &reachability,
        &observer,
    );
    settle().await;
    let mut latest: Option<TransportEvents> = None;
    for call in drain(&mut calls) {
        if let Call::Open { events, .. } = call {
            latest = Some(events);
        }
    }
    assert!(latest.is_some(), "seed {seed}: no connect on start");
    assert_eq!(shuttle.state(), SocketState::Connecting);

    for step in 0..200 {
        settle().await;
        let before = shuttle.state();

        match rng.gen_range(0..9) {
            0 => shuttle.ensure_connected(),
            1 => shuttle.disconnect(),
            2 => reachability.set(INTERFACES[rng.gen_range(0..INTERFACES.len())]),
            3 => {
                if let Some(events) = &latest {
                    events.open();
                }
            }
            4 => {
                if let Some(events) = &latest {
                    let kind = [FailureKind::Refused, FailureKind::Dropped, FailureKind::Other]
                        [rng.gen_range(0..3)];
                    events.failure(kind, eyre::eyre!("step {step}"));
                }
            }
            5 => {
                if let Some(events) = &latest {
                    events.close(CloseCode::Normal, "", rng.gen());
                }
            }
            6 => {
                let result = shuttle.text("ping");
                if before == SocketState::Connected {
                    assert_eq!(result, Ok(()), "seed {seed} step {step}");
                } else {
                    assert_eq!(result, Err(SendError::NotConnected), "seed {seed} step {step}");
                }
            }
            _ => {
                let millis = rng.gen_range(0..15_000);
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
        }
        settle().await;

        let after = shuttle.state();
        let mut opened = 0;
        for call in drain(&mut calls) {
            if let Call::Open { events, .. } = call {
                opened += 1;
                latest = Some(events);
            }
        }
        if opened > 0 {
            assert_eq!(opened, 1, "seed {seed} step {step}: more than one attempt opened");
            assert_eq!(after, SocketState::Connecting, "seed {seed} step {step}");
        }

        let received = drain(&mut notifications);
        let timeouts = received
            .iter()
            .filter(|notification| {
                matches!(
                    notification,
                    Notification::Failure {
                        reason: ErrorReason::Timeout,
                        ..
                    }
                )
            })
            .count();
        assert!(timeouts <= 1, "seed {seed} step {step}: timer fired twice");
        if timeouts == 1 {
            assert_eq!(before, SocketState::Connecting, "seed {seed} step {step}");
        }
        for notification in &received {
            if *notification == Notification::Open {
                assert_eq!(before, SocketState::Connecting, "seed {seed} step {step}");
            }
        }
    }

    // whatever the sequence, at most the current attempt can still time out
    let before = shuttle.state();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let timeouts = drain(&mut notifications)
        .into_iter()
        .filter(|notification| {
            matches!(
                notification,
                Notification::Failure {
                    reason: ErrorReason::Timeout,
                    ..
                }
            )
        })
        .count();
    if before == SocketState::Connecting {
        assert_eq!(timeouts, 1, "seed {seed}");
    } else {
        assert_eq!(timeouts, 0, "seed {seed}");
    }
}

#[tokio::test(start_paused = true)]
async fn require_wlan_never_connects_on_its_own_without_wifi() {
    let mut rng = StdRng::seed_from_u64(7);
    let (transport, mut calls) = mock_transport();
    let (observer, _notifications) = recorder();
    let reachability = ManualReachability::new(InterfaceType::Cellular);
    let (shuttle, _) = Shuttle::create(
        ShuttleConfig::new("ws://127.0.0.1:9001").connect_condition(ConnectCondition::RequireWlan),
        transport,
        &reachability,
        &observer,
    );

    for _ in 0..300 {
        let interface = INTERFACES[rng.gen_range(0..2)];
        reachability.set(interface);
        settle().await;
        tokio::time::sleep(Duration::from_millis(rng.gen_range(0..5_000))).await;
        assert_ne!(shuttle.state(), SocketState::Connecting);
        assert_ne!(shuttle.state(), SocketState::Connected);
    }
    assert!(drain(&mut calls).is_empty());
}
