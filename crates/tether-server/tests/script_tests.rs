use std::io::Write as _;
use std::time::{Duration, Instant};

use serde_json::{json, Value as JsonValue};
use tempfile::NamedTempFile;
use tether_server::{
    Coordinator, CoordinatorConfig, CoordinatorHandle, FaultPolicy, ScriptHost, ServerContext,
    ShutdownCoordinator,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const ECHO_SCRIPT: &str = r#"
var opened = 0;
var closed = 0;
var server = net.listen("127.0.0.1:0", function (kind, id, handle, payload) {
    if (kind === net.CONNECTED) {
        opened += 1;
    } else if (kind === net.DATA) {
        net.send(handle, payload);
    } else if (kind === net.CLOSED) {
        closed += 1;
    }
}, { lengthPrefixed: true });
"#;

struct ScriptServer {
    coordinator: Option<Coordinator<ScriptHost>>,
    runtime: tokio::runtime::Runtime,
    _script: NamedTempFile,
}

impl ScriptServer {
    fn start(source: &str) -> Self {
        let mut script = NamedTempFile::new().unwrap();
        script.write_all(source.as_bytes()).unwrap();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let rt = runtime.handle().clone();
        let path = script.path().to_path_buf();

        let config = CoordinatorConfig::new().with_fault_policy(FaultPolicy::Halt);
        let coordinator = Coordinator::spawn(config, move |handle| {
            ScriptHost::load(ServerContext::new(handle.clone(), rt), path)
        })
        .unwrap();

        Self {
            coordinator: Some(coordinator),
            runtime,
            _script: script,
        }
    }

    fn handle(&self) -> CoordinatorHandle<ScriptHost> {
        self.coordinator.as_ref().unwrap().handle()
    }

    fn eval(&self, source: &str) -> JsonValue {
        let source = source.to_string();
        self.handle().call(move |host| host.eval(&source)).unwrap().unwrap()
    }

    fn addr(&self) -> String {
        match self.eval("net.localAddr(server)") {
            JsonValue::String(addr) => addr,
            other => panic!("listener has no address: {}", other),
        }
    }

    fn wait_for(&self, source: &str, expected: JsonValue) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.eval(source) == expected {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

impl Drop for ScriptServer {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.shutdown();
        }
    }
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(payload).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

#[test]
fn test_echo_script_round_trips_frames() {
    let server = ScriptServer::start(ECHO_SCRIPT);
    let addr = server.addr();

    server.runtime.block_on(async {
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        for payload in [&b"hello"[..], &[0u8, 1, 2, 255][..], &vec![7u8; 10_000][..]] {
            write_frame(&mut stream, payload).await;
            assert_eq!(read_frame(&mut stream).await, payload);
        }
    });

    assert!(server.wait_for("[opened, closed]", json!([1, 1])));
    assert_eq!(server.eval("net.stats().framesReceived"), json!(3));
}

#[test]
fn test_script_sessions_are_independent() {
    let server = ScriptServer::start(ECHO_SCRIPT);
    let addr = server.addr();

    server.runtime.block_on(async {
        let mut first = TcpStream::connect(&addr).await.unwrap();
        let mut second = TcpStream::connect(&addr).await.unwrap();

        write_frame(&mut first, b"one").await;
        write_frame(&mut second, b"two").await;

        assert_eq!(read_frame(&mut second).await, b"two");
        assert_eq!(read_frame(&mut first).await, b"one");
    });

    assert!(server.wait_for("[opened, closed]", json!([2, 2])));
}

#[test]
fn test_set_head_switches_to_length_prefixed() {
    let server = ScriptServer::start(
        r#"
        var server = net.listen("127.0.0.1:0", function (kind, id, handle, payload) {
            if (kind === net.CONNECTED) {
                net.setHead(handle, true);
                net.send(handle, "ready");
            } else if (kind === net.DATA) {
                net.send(handle, payload);
            }
        }, { eager: true });
        "#,
    );
    let addr = server.addr();

    server.runtime.block_on(async {
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        assert_eq!(read_frame(&mut stream).await, b"ready");

        write_frame(&mut stream, b"ping").await;
        assert_eq!(read_frame(&mut stream).await, b"ping");
    });
}

#[test]
fn test_script_timeout_closes_idle_session() {
    let server = ScriptServer::start(
        r#"
        var closed = 0;
        var server = net.listen("127.0.0.1:0", function (kind, id, handle, payload) {
            if (kind === net.CONNECTED) {
                net.setTimeout(handle, 0.2);
            } else if (kind === net.CLOSED) {
                closed += 1;
            }
        }, { lengthPrefixed: true });
        "#,
    );
    let addr = server.addr();

    let stream = server.runtime.block_on(async {
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        write_frame(&mut stream, b"hello").await;
        stream
    });

    // The client stays connected and silent; only the deadline can close it.
    assert!(server.wait_for("closed", json!(1)));
    assert_eq!(server.eval("net.stats().timeouts"), json!(1));
    drop(stream);
}

#[test]
fn test_script_close_ends_connection() {
    let server = ScriptServer::start(
        r#"
        var results = [];
        var closed = 0;
        var server = net.listen("127.0.0.1:0", function (kind, id, handle, payload) {
            if (kind === net.DATA) {
                results.push(net.close(handle));
                results.push(net.close(handle));
                results.push(net.send(handle, "late"));
            } else if (kind === net.CLOSED) {
                closed += 1;
            }
        }, { lengthPrefixed: true });
        "#,
    );
    let addr = server.addr();

    server.runtime.block_on(async {
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        write_frame(&mut stream, b"bye").await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    });

    assert!(server.wait_for("closed", json!(1)));
    assert_eq!(server.eval("results"), json!([true, false, -1]));
}

#[test]
fn test_quit_hook_runs_on_drain() {
    let mut server = ScriptServer::start(
        r#"
        function onApplicationQuit(signal) {
            net.shutdown(server);
        }
        var server = net.listen("127.0.0.1:0", function () {});
        "#,
    );
    let addr = server.addr();
    let handle = server.handle();

    let drained = server.runtime.block_on(async {
        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let shutdown = ShutdownCoordinator::new(handle.clone());
        let drained = shutdown.drain("SIGTERM").await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        drained
    });

    assert!(drained);
    if let Some(coordinator) = server.coordinator.take() {
        coordinator.join();
    }
    assert!(handle.is_stopped());
}
