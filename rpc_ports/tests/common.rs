//! Shared scaffolding for the integration tests: the test interface type
//! and a loopback transport built from two bridged network-element ports
//! with poll-driven pump threads.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rpc_ports::encoding::OutputStream;
use rpc_ports::{
    execute_frame, CallFrameKind, CallHandle, CallSender, ClientPort, CreationInfo, Future,
    FutureStatus, Promise, RpcError,
};

/// Test interface covering every call shape.
pub struct TestService {
    pub test_called: bool,
    pub last_string: String,
    pub scan: Option<Promise<i32>>,
}

impl TestService {
    pub fn new() -> Self {
        Self {
            test_called: false,
            last_string: String::new(),
            scan: None,
        }
    }

    pub fn multiply(&mut self, factor: f64) -> rpc_ports::Result<i32> {
        Ok((4.0 * factor) as i32)
    }

    pub fn test(&mut self) -> rpc_ports::Result<()> {
        self.test_called = true;
        Ok(())
    }

    pub fn string_test(&mut self, value: String) -> rpc_ports::Result<()> {
        self.last_string = value;
        Ok(())
    }

    pub fn echo(&mut self, value: String) -> rpc_ports::Result<String> {
        Ok(value)
    }

    pub fn sum(&mut self, values: Vec<f64>) -> rpc_ports::Result<f64> {
        Ok(values.iter().sum())
    }

    pub fn fail(&mut self) -> rpc_ports::Result<i32> {
        Err(RpcError::InvalidCall)
    }

    pub fn slow_multiply(&mut self, factor: f64) -> rpc_ports::Result<i32> {
        std::thread::sleep(Duration::from_millis(500));
        Ok((4.0 * factor) as i32)
    }

    /// Native-future method: the value arrives from a worker thread.
    pub fn delayed_multiply(&mut self, factor: f64) -> rpc_ports::Result<Future<i32>> {
        let promise = Promise::<i32>::new();
        let future = promise.future()?;
        let mut promise = promise;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            promise.set_value((4.0 * factor) as i32);
        });
        Ok(future)
    }

    /// Promise method: the server stores a split half and fulfils later.
    pub fn begin_scan(&mut self) -> rpc_ports::Result<Promise<i32>> {
        let promise = Promise::new();
        self.scan = Some(promise.split());
        Ok(promise)
    }
}

impl rpc_ports::RpcInterface for TestService {}

static TEST_TYPE: LazyLock<rpc_ports::RpcInterfaceType<TestService>> = LazyLock::new(|| {
    rpc_ports::RpcInterfaceType::builder("TestService")
        .method(TestService::multiply)
        .method(TestService::test)
        .method(TestService::string_test)
        .method(TestService::echo)
        .method(TestService::sum)
        .method(TestService::fail)
        .method(TestService::slow_multiply)
        .future_method(TestService::delayed_multiply)
        .promise_method(TestService::begin_scan)
        .register()
});

/// Registers (once) and returns the test interface type.
pub fn test_type() -> rpc_ports::RpcInterfaceType<TestService> {
    *TEST_TYPE
}

/// Response handler recording everything it sees.
pub struct RecordingHandler<T> {
    pub responses: Arc<Mutex<Vec<T>>>,
    pub errors: Arc<Mutex<Vec<RpcError>>>,
}

impl<T> RecordingHandler<T> {
    pub fn new() -> (Self, Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<RpcError>>>) {
        let responses = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                responses: responses.clone(),
                errors: errors.clone(),
            },
            responses,
            errors,
        )
    }
}

impl<T: Send> rpc_ports::ResponseHandler<T> for RecordingHandler<T> {
    fn handle_response(&mut self, value: T) {
        self.responses.lock().unwrap().push(value);
    }

    fn handle_exception(&mut self, error: RpcError) {
        self.errors.lock().unwrap().push(error);
    }
}

/// Polls until `predicate` holds or the deadline expires.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    predicate()
}

/// One direction of the loopback bridge.
struct Side {
    tx: Sender<Vec<u8>>,
    gated: Mutex<VecDeque<CallHandle>>,
    pending: Mutex<HashMap<u64, CallHandle>>,
    running: AtomicBool,
}

impl Side {
    fn new(tx: Sender<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            gated: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        })
    }

    fn enqueue(&self, call: CallHandle) {
        if call.ready_for_sending() {
            self.transmit(call);
        } else {
            self.gated.lock().unwrap().push_back(call);
        }
    }

    fn transmit(&self, call: CallHandle) {
        let Some(kind) = CallFrameKind::of(&call) else {
            return;
        };
        let mut frame = vec![kind as u8];
        if call.serialize(&mut OutputStream::new(&mut frame)).is_err() {
            return;
        }
        if kind == CallFrameKind::Request {
            // Retain the request until its response is matched back.
            self.pending.lock().unwrap().insert(call.call_id(), call);
        }
        let _ = self.tx.send(frame);
    }

    fn flush_gated(&self) {
        let ready: Vec<CallHandle> = {
            let mut gated = self.gated.lock().unwrap();
            let mut ready = Vec::new();
            let mut index = 0;
            while index < gated.len() {
                if gated[index].ready_for_sending() {
                    ready.push(gated.remove(index).unwrap());
                } else {
                    index += 1;
                }
            }
            ready
        };
        for call in ready {
            self.transmit(call);
        }
    }

    /// Connection teardown: every retained request observes the loss.
    fn fail_pending(&self, status: FutureStatus) {
        let handles: Vec<CallHandle> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.set_exception(status);
        }
    }
}

struct SideSender {
    side: Arc<Side>,
}

impl CallSender for SideSender {
    fn send_call(&self, call: CallHandle) {
        self.side.enqueue(call);
    }
}

impl rpc_ports::ResponseSender for SideSender {
    fn send_response(&self, response: CallHandle) {
        self.side.enqueue(response);
    }
}

/// A loopback transport bridging one client-side and one server-side
/// network element in the same process.
pub struct Loopback {
    pub client_net: Arc<rpc_ports::RpcPort>,
    pub server_net: Arc<rpc_ports::RpcPort>,
    client_side: Arc<Side>,
    server_side: Arc<Side>,
    pumps: Vec<JoinHandle<()>>,
}

impl Loopback {
    /// Builds the bridge and wires the server-side network element to the
    /// given server port.
    pub fn new(server: &rpc_ports::ServerPort<TestService>) -> Self {
        let info = test_type().info();
        let (to_server, from_client) = mpsc::channel();
        let (to_client, from_server) = mpsc::channel();
        let client_side = Side::new(to_server);
        let server_side = Side::new(to_client);

        let client_net = rpc_ports::RpcPort::network(
            CreationInfo::new("client-net"),
            info,
            Box::new(SideSender {
                side: client_side.clone(),
            }),
        );
        let server_net = rpc_ports::RpcPort::network(
            CreationInfo::new("server-net"),
            info,
            Box::new(SideSender {
                side: server_side.clone(),
            }),
        );
        server_net.connect_to(server.port().expect("server port exists"));

        let pumps = vec![
            spawn_pump(client_side.clone(), from_server, client_net.clone()),
            spawn_pump(server_side.clone(), from_client, server_net.clone()),
        ];

        Self {
            client_net,
            server_net,
            client_side,
            server_side,
            pumps,
        }
    }

    /// Simulates the death of the server process: its pump stops, queued
    /// responses are dropped, and the client-side transport fails every
    /// retained request.
    pub fn kill_server(&mut self) {
        self.server_side.running.store(false, Ordering::Release);
        self.server_side.gated.lock().unwrap().clear();
        self.server_side.fail_pending(FutureStatus::BrokenPromise);
        self.client_side.fail_pending(FutureStatus::BrokenPromise);
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.client_side.running.store(false, Ordering::Release);
        self.server_side.running.store(false, Ordering::Release);
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
        self.client_side.fail_pending(FutureStatus::BrokenPromise);
        self.server_side.fail_pending(FutureStatus::BrokenPromise);
        self.client_side.gated.lock().unwrap().clear();
        self.server_side.gated.lock().unwrap().clear();
    }
}

fn spawn_pump(
    side: Arc<Side>,
    rx: Receiver<Vec<u8>>,
    port: Arc<rpc_ports::RpcPort>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let sender: Arc<dyn rpc_ports::ResponseSender> = Arc::new(SideSender { side: side.clone() });
        while side.running.load(Ordering::Acquire) {
            side.flush_gated();
            match rx.recv_timeout(Duration::from_millis(1)) {
                Ok(frame) => execute_frame(&frame, &port, &sender, |id| {
                    side.pending.lock().unwrap().remove(&id)
                }),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

/// Builds the default test fixture: client port, server port with a fresh
/// handler, bridged by a loopback transport.
pub fn loopback_fixture() -> (
    ClientPort<TestService>,
    Arc<Mutex<TestService>>,
    rpc_ports::ServerPort<TestService>,
    Loopback,
) {
    let _ = test_type();
    let handler = Arc::new(Mutex::new(TestService::new()));
    let server = rpc_ports::ServerPort::new(handler.clone(), "server");
    let loopback = Loopback::new(&server);
    let client = ClientPort::<TestService>::new("client");
    client.connect_to_port(&loopback.client_net);
    (client, handler, server, loopback)
}
