mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{frame, listen, spawn_mock, wait_until, MockOptions, OnData};
use tether_common::{ConnectPolicy, Framing, ListenerConfig, TetherError};
use tether_server::{CloseReason, Handle, ScriptEngine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CONNECTED: i64 = 1;
const DATA: i64 = 2;
const CLOSED: i64 = 3;

const WAIT: Duration = Duration::from_secs(5);

fn length_prefixed() -> ListenerConfig {
    ListenerConfig::new().with_framing(Framing::LengthPrefixed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_are_ordered_per_session() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let (listener, callback) = listen(&handle, length_prefixed()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    for i in 0..5u8 {
        client.write_all(&frame(&[i; 3])).await.unwrap();
    }
    client.flush().await.unwrap();
    drop(client);

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);

    let calls = recorder.calls_for(1);
    let kinds: Vec<i64> = calls.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![CONNECTED, DATA, DATA, DATA, DATA, DATA, CLOSED]);

    let payloads: Vec<Vec<u8>> = calls
        .iter()
        .filter_map(|c| c.payload.as_ref().map(|p| p.to_vec()))
        .collect();
    assert_eq!(payloads, (0..5u8).map(|i| vec![i; 3]).collect::<Vec<_>>());

    // Same callback and same non-zero handle for every event.
    assert!(calls.iter().all(|c| c.callback == callback));
    assert!(calls.iter().all(|c| c.session_handle == calls[0].session_handle));
    assert_ne!(calls[0].session_handle, 0);

    // The session handle is released after the closed event.
    let sessions = handle.call_async(|e| e.session_count()).await.unwrap();
    assert_eq!(sessions, 0);

    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_ids_are_monotonic_from_one() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    for _ in 0..3 {
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(&frame(b"hi")).await.unwrap();
        drop(client);
        let closed = recorder.count_kind(CLOSED);
        assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == closed + 1).await);
    }

    let mut ids: Vec<i64> = recorder
        .calls()
        .iter()
        .filter(|c| c.kind == CONNECTED)
        .map(|c| c.session_id)
        .collect();
    ids.dedup();
    assert_eq!(ids, vec![1, 2, 3]);

    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_sessions_keep_their_own_order() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;
    let addr = listener.local_addr();

    let clients: Vec<_> = (0..8)
        .map(|_| {
            tokio::spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                for i in 0..10u8 {
                    client.write_all(&frame(&[i])).await.unwrap();
                }
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 8).await);

    for id in 1..=8 {
        let calls = recorder.calls_for(id);
        assert_eq!(calls.first().map(|c| c.kind), Some(CONNECTED));
        assert_eq!(calls.last().map(|c| c.kind), Some(CLOSED));
        let data: Vec<u8> = calls
            .iter()
            .filter(|c| c.kind == DATA)
            .map(|c| c.payload.as_ref().unwrap()[0])
            .collect();
        assert_eq!(data, (0..10u8).collect::<Vec<_>>());
    }

    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_length_prefixed_echo_round_trip() {
    let (coordinator, recorder) = spawn_mock(MockOptions {
        on_data: OnData::Echo,
        ..Default::default()
    });
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    for size in [1usize, 1000, 65535] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        client.write_all(&frame(&payload)).await.unwrap();

        let mut header = [0u8; 4];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(u32::from_be_bytes(header) as usize, size);

        let mut echoed = vec![0u8; size];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
    }

    assert!(recorder.send_statuses.lock().unwrap().iter().all(|s| *s == 0));

    drop(client);
    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_frame_is_delivered_as_nil() {
    let (coordinator, recorder) = spawn_mock(MockOptions {
        on_data: OnData::Echo,
        ..Default::default()
    });
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&frame(b"")).await.unwrap();

    let mut header = [0u8; 4];
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(header, [0, 0, 0, 0]);

    let data: Vec<_> = recorder
        .calls_for(1)
        .into_iter()
        .filter(|c| c.kind == DATA)
        .collect();
    assert_eq!(data.len(), 1);
    assert!(data[0].payload.is_none());

    drop(client);
    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_chunk_mode_delivers_bytes_as_they_arrive() {
    let (coordinator, recorder) = spawn_mock(MockOptions {
        on_data: OnData::Echo,
        ..Default::default()
    });
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, ListenerConfig::default()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(recorder.kinds_for(1)[..2], [CONNECTED, DATA]);

    drop(client);
    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overflow_closes_slow_peer() {
    let (coordinator, recorder) = spawn_mock(MockOptions {
        on_data: OnData::Burst(64),
        ..Default::default()
    });
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    // The client never reads, so the write loop stalls on a full socket.
    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    let big = vec![7u8; 1024 * 1024];
    client.write_all(&frame(&big)).await.unwrap();

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);

    let statuses = recorder.send_statuses.lock().unwrap().clone();
    let first_failure = statuses.iter().position(|s| *s != 0).unwrap();
    assert_eq!(statuses[first_failure], -2);
    assert!(statuses[first_failure + 1..].iter().all(|s| *s == -1));

    let snapshot = handle.metrics().snapshot();
    assert_eq!(snapshot.overflow_drops, 1);

    drop(client);
    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_timeout_closes_idle_session() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let config = length_prefixed().with_io_timeout(Duration::from_millis(100));
    let (listener, _) = listen(&handle, config).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&frame(b"once")).await.unwrap();

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);
    assert_eq!(recorder.kinds_for(1), vec![CONNECTED, DATA, CLOSED]);
    assert_eq!(handle.metrics().snapshot().timeouts, 1);

    // The server side dropped the socket.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);

    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deferred_silent_connection_is_invisible() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    let client = TcpStream::connect(listener.local_addr()).await.unwrap();
    drop(client);

    let metrics = handle.metrics().clone();
    assert!(wait_until(WAIT, || metrics.snapshot().sessions_closed == 1).await);
    assert!(recorder.calls().is_empty());

    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_eager_connect_for_silent_connection() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let config = length_prefixed().with_connect_policy(ConnectPolicy::Eager);
    let (listener, _) = listen(&handle, config).await;

    let client = TcpStream::connect(listener.local_addr()).await.unwrap();
    assert!(wait_until(WAIT, || recorder.count_kind(CONNECTED) == 1).await);
    drop(client);

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);
    assert_eq!(recorder.kinds_for(1), vec![CONNECTED, CLOSED]);

    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_shutdown_closes_sessions() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let (listener, callback) = listen(&handle, length_prefixed()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&frame(b"hello")).await.unwrap();
    assert!(wait_until(WAIT, || recorder.count_kind(DATA) == 1).await);

    listener.close().await;

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);

    // With the listener and its only session gone, the callback is released.
    assert!(wait_until(WAIT, || recorder.released.lock().unwrap().contains(&callback)).await);
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_double_close_emits_single_closed_event() {
    let (coordinator, recorder) = spawn_mock(MockOptions {
        on_data: OnData::CloseTwice,
        ..Default::default()
    });
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&frame(b"bye")).await.unwrap();

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.count_kind(CLOSED), 1);
    assert_eq!(*recorder.close_results.lock().unwrap(), vec![true, false]);

    drop(client);
    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_close_releases_handle_once() {
    const CLOSERS: usize = 8;

    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&frame(b"hi")).await.unwrap();
    assert!(wait_until(WAIT, || recorder.count_kind(DATA) == 1).await);

    let raw = recorder.calls_for(1)[0].session_handle as u32;
    let session_handle = Handle::from_raw(raw).unwrap();
    let session = handle
        .call_async(move |engine| engine.sessions().resolve(session_handle))
        .await
        .unwrap()
        .unwrap();

    let barrier = Arc::new(Barrier::new(CLOSERS));
    let closers: Vec<_> = (0..CLOSERS)
        .map(|i| {
            let session = Arc::clone(&session);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                if i % 2 == 0 {
                    session.close()
                } else {
                    session.close_with(CloseReason::Timeout)
                }
            })
        })
        .collect();
    let transitions = closers
        .into_iter()
        .map(|closer| closer.join().unwrap())
        .filter(|closed| *closed)
        .count();
    assert_eq!(transitions, 1);

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count_kind(CLOSED), 1);

    let sessions = handle.call_async(|engine| engine.session_count()).await.unwrap();
    assert_eq!(sessions, 0);
    let second_release = handle
        .call_async(move |engine| engine.sessions().release(session_handle).map(|_| ()))
        .await
        .unwrap();
    assert!(matches!(second_release, Err(TetherError::HandleNotFound(id)) if id == raw));

    drop(client);
    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_error_does_not_close_session() {
    let (coordinator, _recorder) = spawn_mock(MockOptions {
        fail_connected: true,
        on_data: OnData::Echo,
        ..Default::default()
    });
    let handle = coordinator.handle();
    let (listener, _) = listen(&handle, length_prefixed()).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&frame(b"still here")).await.unwrap();

    let mut echoed = vec![0u8; 4 + 10];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed[4..], b"still here");
    assert_eq!(handle.metrics().snapshot().script_errors, 1);

    drop(client);
    listener.close().await;
    handle.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_frame_closes_session() {
    let (coordinator, recorder) = spawn_mock(MockOptions::default());
    let handle = coordinator.handle();
    let config = length_prefixed()
        .with_max_frame_size(16)
        .with_connect_policy(ConnectPolicy::Eager);
    let (listener, _) = listen(&handle, config).await;

    let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
    client.write_all(&frame(&[0u8; 17])).await.unwrap();

    assert!(wait_until(WAIT, || recorder.count_kind(CLOSED) == 1).await);
    assert_eq!(recorder.kinds_for(1), vec![CONNECTED, CLOSED]);

    listener.close().await;
    handle.stop();
}
