//! Session behaviour against a scripted transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pc80b_rs::transport::TransportEvent;
use pc80b_rs::{
    Command, DeviceSession, SampleSink, SessionConfig, SessionState, TransmissionType,
};

use common::*;
use SessionState::*;

fn session(
    transport: ScriptedTransport,
    config: SessionConfig,
) -> (DeviceSession<ScriptedTransport>, Arc<SampleSink>) {
    let sink = Arc::new(SampleSink::default());
    (DeviceSession::new(transport, Arc::clone(&sink), config), sink)
}

fn select_continuous() -> Vec<u8> {
    Command::SelectTransmission(TransmissionType::Continuous).encode()
}

#[tokio::test]
async fn test_state_sequence_through_disconnect() {
    let transport = ScriptedTransport::new()
        .advertise(stranger())
        .advertise(recorder())
        .link(Link::up(vec![
            notify(handshake()),
            notify(continuous(1)),
            notify(continuous(2)),
            notify(continuous(3)),
            TransportEvent::Disconnected,
        ]));
    let calls = transport.calls();
    let (session, sink) = session(transport, quick_config());
    let mut states = session.subscribe_states();
    let handle = session.start();

    let first = states_until(&mut states, Disconnected).await;
    assert_eq!(
        first,
        vec![Scanning, Found, Connecting, Connected, Streaming, Disconnected]
    );
    assert_eq!(states_until(&mut states, Scanning).await, vec![Scanning]);
    eventually(|| sink.get_status().text == "Scanning").await;
    assert_eq!(sink.len(), 75);
    assert_eq!(calls.writes(), vec![select_continuous()]);

    handle.stop().await;
    assert_eq!(states_until(&mut states, Stopped).await, vec![Stopped]);
    assert_eq!(handle.state(), Stopped);
    assert_eq!(handle.stats().reconnects, 1);
    // Only the recorder was connected to, and the link was already gone.
    assert_eq!(calls.count(&Call::Connect(recorder().address)), 1);
    assert_eq!(calls.count(&Call::Disconnect), 0);
}

#[tokio::test]
async fn test_handshake_answered_before_any_ack() {
    let mut stream = handshake();
    for seq in 0..=200u8 {
        stream.extend(continuous(seq));
    }
    stream.extend(continuous_final(201));

    let transport = ScriptedTransport::new()
        .advertise(recorder())
        .link(Link::up(chunked(&stream, 20)));
    let calls = transport.calls();
    let (session, sink) = session(transport, quick_config());
    let handle = session.start();

    eventually(|| calls.writes().len() == 6).await;

    let mut expected = vec![select_continuous()];
    for seq in [0u8, 64, 128, 192, 201] {
        expected.push(Command::Acknowledge(seq).encode());
    }
    assert_eq!(calls.writes(), expected);

    eventually(|| handle.stats().frames_decoded == 203).await;
    let stats = handle.stats();
    assert_eq!(stats.acks_sent, 5);
    assert_eq!(stats.framing_errors, 0);
    assert_eq!(sink.len(), sink.capacity());
    assert!(sink.pull(5).iter().all(|s| (s.value - 1.0).abs() < 1e-9));
    let status = sink.get_status();
    assert!(!status.active);
    assert_eq!(status.text, "Ready for acquisition");

    handle.stop().await;
}

#[tokio::test]
async fn test_fast_measurement_streams_without_acks() {
    let transport = ScriptedTransport::new().advertise(recorder()).link(Link::up(vec![
        notify(fast_handshake()),
        notify(fast(0, STAGE_MEASURING, 25)),
        notify(fast(1, STAGE_MEASURING, 25)),
        notify(fast(64, STAGE_MEASURING, 25)),
        notify(fast(65, STAGE_STOP, 0)),
    ]));
    let calls = transport.calls();
    let (session, sink) = session(transport, quick_config());
    let handle = session.start();

    eventually(|| handle.stats().frames_decoded == 5).await;

    let select_fast = Command::SelectTransmission(TransmissionType::Fast).encode();
    assert_eq!(&select_fast[..4], &[0xA5, 0x55, 0x01, 0x00]);
    assert_eq!(calls.writes(), vec![select_fast]);
    assert_eq!(handle.stats().acks_sent, 0);

    assert_eq!(sink.len(), 75);
    assert!(sink.pull(75).iter().all(|s| (s.value - 1.0).abs() < 1e-9));
    assert_eq!(sink.meta().heart_rate, 75);
    let status = sink.get_status();
    assert!(!status.active);
    assert_eq!(status.text, "Ready for acquisition");

    handle.stop().await;
}

#[tokio::test]
async fn test_stop_while_streaming_disconnects_once() {
    let transport = ScriptedTransport::new()
        .advertise(recorder())
        .link(Link::up(vec![notify(handshake()), notify(continuous(0))]));
    let calls = transport.calls();
    let (session, sink) = session(transport, quick_config());
    let mut states = session.subscribe_states();
    let handle = session.start();

    states_until(&mut states, Streaming).await;
    eventually(|| calls.writes().len() == 2).await;
    assert!(sink.get_status().active);

    handle.stop().await;
    handle.stop().await;

    assert_eq!(calls.count(&Call::Disconnect), 1);
    assert_eq!(handle.state(), Stopped);
    assert!(sink.is_empty());
    let status = sink.get_status();
    assert!(!status.active);
    assert_eq!(status.text, "Acquisition stopped");
}

#[tokio::test]
async fn test_connect_timeout_restarts_from_scanning() {
    let transport = ScriptedTransport::new()
        .advertise(recorder())
        .advertise(recorder())
        .link(Link::Timeout)
        .link(Link::up(vec![notify(handshake())]));
    let calls = transport.calls();
    let (session, _sink) = session(transport, quick_config());
    let mut states = session.subscribe_states();
    let handle = session.start();

    let seen = states_until(&mut states, Streaming).await;
    assert_eq!(
        seen,
        vec![Scanning, Found, Connecting, Scanning, Found, Connecting, Connected, Streaming]
    );
    eventually(|| calls.writes() == vec![select_continuous()]).await;
    assert_eq!(handle.stats().reconnects, 0);

    handle.stop().await;
    assert_eq!(calls.count(&Call::Disconnect), 1);
}

#[tokio::test]
async fn test_disconnect_during_setup_is_ignored() {
    let transport = ScriptedTransport::new()
        .advertise(recorder())
        .link(Link::up(vec![notify(handshake())]).with_setup_disconnect());
    let calls = transport.calls();
    let (session, _sink) = session(transport, quick_config());
    let mut states = session.subscribe_states();
    let handle = session.start();

    states_until(&mut states, Streaming).await;
    eventually(|| calls.writes() == vec![select_continuous()]).await;
    assert_eq!(handle.state(), Streaming);
    assert!(states.try_recv().is_err());

    handle.stop().await;
}

#[tokio::test]
async fn test_corrupt_frame_is_dropped_and_streaming_continues() {
    let mut corrupt = continuous(0);
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xFF;

    let transport = ScriptedTransport::new().advertise(recorder()).link(Link::up(vec![
        notify(handshake()),
        notify(corrupt),
        notify(continuous(64)),
    ]));
    let calls = transport.calls();
    let (session, sink) = session(transport, quick_config());
    let handle = session.start();

    eventually(|| calls.writes().len() == 2).await;
    assert_eq!(
        calls.writes(),
        vec![select_continuous(), Command::Acknowledge(64).encode()]
    );
    let stats = handle.stats();
    assert_eq!(stats.framing_errors, 1);
    assert_eq!(stats.frames_decoded, 2);
    assert_eq!(sink.len(), 25);
    assert_eq!(handle.state(), Streaming);

    handle.stop().await;
}

#[tokio::test]
async fn test_stop_before_connecting_skips_disconnect() {
    let config = SessionConfig {
        settle_delay: Duration::from_secs(3600),
        ..quick_config()
    };
    let transport = ScriptedTransport::new().advertise(recorder());
    let calls = transport.calls();
    let (session, _sink) = session(transport, config);
    let mut states = session.subscribe_states();
    let handle = session.start();

    states_until(&mut states, Found).await;
    handle.stop().await;

    assert_eq!(states_until(&mut states, Stopped).await, vec![Stopped]);
    assert_eq!(calls.count(&Call::Connect(recorder().address)), 0);
    assert_eq!(calls.count(&Call::Disconnect), 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_only_when_link_idle() {
    let config = SessionConfig {
        heartbeat_interval: Duration::from_secs(10),
        heartbeat_check: Duration::from_secs(1),
        ..quick_config()
    };
    let transport = ScriptedTransport::new()
        .advertise(recorder())
        .link(Link::up(vec![notify(handshake())]));
    let calls = transport.calls();
    let (session, _sink) = session(transport, config);
    let handle = session.start();

    tokio::time::sleep(Duration::from_millis(25_500)).await;

    let heartbeat = Command::Heartbeat.encode();
    let writes = calls.writes();
    assert_eq!(writes[0], select_continuous());
    assert_eq!(writes.iter().filter(|w| **w == heartbeat).count(), 2);
    assert_eq!(handle.stats().heartbeats_sent, 2);

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ack_write_postpones_heartbeat() {
    let config = SessionConfig {
        heartbeat_interval: Duration::from_secs(10),
        heartbeat_check: Duration::from_secs(1),
        ..quick_config()
    };
    let transport = ScriptedTransport::new().advertise(recorder()).link(Link::timed(vec![
        (Duration::ZERO, notify(handshake())),
        (Duration::from_secs(8), notify(continuous(0))),
    ]));
    let calls = transport.calls();
    let (session, _sink) = session(transport, config);
    let handle = session.start();

    tokio::time::sleep(Duration::from_millis(17_500)).await;
    assert_eq!(
        calls.writes(),
        vec![select_continuous(), Command::Acknowledge(0).encode()]
    );
    assert_eq!(handle.stats().heartbeats_sent, 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.writes().last(), Some(&Command::Heartbeat.encode()));
    assert_eq!(handle.stats().heartbeats_sent, 1);

    handle.stop().await;
}
