//! Full offer/answer/candidate round-trip between two in-process peer
//! sessions, over host candidates only.

use std::time::Duration;

use tokio::time::timeout;

use parley_media::{
    CallConfig, CallEvent, CaptureMode, ConnectionState, IceConfig, MediaConstraints, PeerSession,
};

fn test_config() -> CallConfig {
    CallConfig {
        ice: IceConfig::host_only(),
        capture: CaptureMode::External,
        ..CallConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offer_answer_roundtrip_reaches_connected() {
    let (mut caller, mut caller_rx) = PeerSession::new(test_config());
    let (mut callee, mut callee_rx) = PeerSession::new(test_config());

    caller.initialize(true).await.unwrap();
    caller
        .acquire_local_media(MediaConstraints::default())
        .await
        .unwrap();

    callee.initialize(false).await.unwrap();
    callee
        .acquire_local_media(MediaConstraints::default())
        .await
        .unwrap();

    let offer = caller.create_offer().await.unwrap();
    callee.handle_offer(offer).await.unwrap();
    let answer = callee.create_answer().await.unwrap();
    caller.handle_answer(answer).await.unwrap();

    // Shuttle gathered candidates across until both sides connect.
    let result = timeout(Duration::from_secs(30), async {
        let mut caller_connected = false;
        let mut callee_connected = false;
        let mut exchanged = 0u32;

        while !(caller_connected && callee_connected) {
            tokio::select! {
                event = caller_rx.recv() => match event.expect("caller events") {
                    CallEvent::IceCandidate(candidate) => {
                        callee.add_remote_candidate(candidate).await.unwrap();
                        exchanged += 1;
                    }
                    CallEvent::Connected => caller_connected = true,
                    _ => {}
                },
                event = callee_rx.recv() => match event.expect("callee events") {
                    CallEvent::IceCandidate(candidate) => {
                        caller.add_remote_candidate(candidate).await.unwrap();
                        exchanged += 1;
                    }
                    CallEvent::Connected => callee_connected = true,
                    _ => {}
                },
            }
        }

        exchanged
    })
    .await;

    let exchanged = result.expect("negotiation did not complete in time");
    assert!(exchanged >= 2, "expected candidates in both directions");
    assert_eq!(caller.connection_state(), ConnectionState::Connected);
    assert_eq!(callee.connection_state(), ConnectionState::Connected);

    caller.cleanup().await;
    callee.cleanup().await;
}
