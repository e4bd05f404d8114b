//! Shared helpers for transport end-to-end tests.

#![allow(dead_code)]

use meridian_agents::{DisconnectedTransport, Endpoint, RemoteTransport};
use meridian_test_utils::fixtures::StationHarness;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

pub const WAIT: Duration = Duration::from_secs(5);
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// A station whose inbound server runs on its own runtime.
pub struct ServedStation {
    pub harness: StationHarness,
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    runtime: Option<Runtime>,
}

impl ServedStation {
    /// Harness reachable at `127.0.0.1:<port>` that cannot call out.
    pub fn harness(port: u16) -> StationHarness {
        StationHarness::new("127.0.0.1", port, Arc::new(DisconnectedTransport))
    }

    pub fn new(harness: StationHarness, addr: SocketAddr, stop: oneshot::Sender<()>, runtime: Runtime) -> Self {
        Self {
            harness,
            addr,
            stop: Some(stop),
            runtime: Some(runtime),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.harness.endpoint.clone()
    }
}

impl Drop for ServedStation {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(WAIT);
        }
    }
}

pub fn server_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("server runtime")
}

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

pub fn wait_until_listening(addr: SocketAddr) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(100)).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("server at {} never came up", addr);
}

pub fn wait_for_log(harness: &StationHarness, needle: &str) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if harness.recorder.log_messages().iter().any(|m| m == needle) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Client-side harness named `alpha` using `transport`.
pub fn alpha(transport: Arc<dyn RemoteTransport>) -> StationHarness {
    StationHarness::new("alpha", 7000, transport)
}
