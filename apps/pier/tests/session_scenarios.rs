//! End-to-end protocol scenarios over loopback TCP.
//!
//! The full coordinator runs against an in-process media stack and a
//! recording presenter; the test plays the headset client side of the
//! wire with raw frames.

use async_trait::async_trait;
use pier::advertise::{AdvertiseError, ServiceAdvertiser, ServiceRegistration};
use pier::config::Config;
use pier::coordinator::{Coordinator, HostStatus, MediaStack, MediaStackFactory};
use pier::logsink::{LogSink, MemoryLogSink};
use pier::presenter::Presenter;
use pier::rpc::{MediaServiceRpc, MediaServiceState, RpcError};
use pier::session::{BarcodePayload, SessionInformation};
use pier_proto::framing::{read_frame, write_frame, FrameError};
use pier_proto::messages::SessionStatus;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SERVER_ID: &str = "0123456789abcdef0123456789abcdef";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// -------------------------------------------------------------------
// scenarios
// -------------------------------------------------------------------

#[tokio::test]
async fn happy_path_without_repairing() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let ack = client.recv().await;
    assert_eq!(ack["Event"], "AcknowledgeConnection");
    assert_eq!(ack["SessionID"], "S1");
    assert_eq!(ack["ServerID"], SERVER_ID);
    assert_eq!(ack["CertificateFingerprint"], "F1");

    client.send(status_change("S1", "WAITING")).await;
    let ready = client.recv().await;
    assert_eq!(ready["Event"], "MediaStreamIsReady");
    assert_eq!(ready["SessionID"], "S1");

    let rpc = host.factory.rpc(0);
    assert_eq!(rpc.started_versions(), vec!["6.0.0".to_string()]);
    assert!(rpc.runtime_running());

    host.presenter
        .wait_for(|calls| {
            calls
                .iter()
                .any(|call| matches!(call, PresenterCall::Status(SessionStatus::Waiting)))
        })
        .await;

    host.stop().await;
}

#[tokio::test]
async fn qr_pairing_presents_the_active_session() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let _ack = client.recv().await;

    client.send(json!({
        "Event": "RequestBarcodePresentation",
        "SessionID": "S1",
    })).await;
    let ack = client.recv().await;
    assert_eq!(ack["Event"], "AcknowledgeBarcodePresentation");
    assert_eq!(ack["SessionID"], "S1");

    host.presenter
        .wait_for(|calls| {
            calls.iter().any(|call| {
                matches!(
                    call,
                    PresenterCall::BarcodeRequested(info)
                        if info.session_id == "S1"
                            && info.client_id == "C1"
                            && info.barcode.client_token == "token-C1"
                            && info.barcode.certificate_fingerprint == "F1"
                )
            })
        })
        .await;

    host.stop().await;
}

#[tokio::test]
async fn force_barcode_omits_the_fingerprint_key() {
    let host = TestHost::start(true).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let ack = client.recv().await;
    assert_eq!(ack["Event"], "AcknowledgeConnection");
    let object = ack.as_object().expect("ack is an object");
    assert!(
        !object.contains_key("CertificateFingerprint"),
        "fingerprint key must be absent, got {ack}"
    );

    host.stop().await;
}

#[tokio::test]
async fn version_mismatch_disconnects_and_closes() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "2")).await;
    let reply = client.recv().await;
    assert_eq!(reply["Event"], "RequestSessionDisconnect");
    assert_eq!(reply["SessionID"], "S1");

    let err = client.recv_err().await;
    assert!(matches!(err, FrameError::PeerClosed), "got {err:?}");

    host.presenter
        .wait_for(|calls| {
            calls
                .iter()
                .any(|call| matches!(call, PresenterCall::ConnectionError(_)))
        })
        .await;

    // The listener survives the rejected client.
    let mut retry = TestClient::connect(host.addr).await;
    retry.send(request_connection("S1", "C1", "1")).await;
    assert_eq!(retry.recv().await["Event"], "AcknowledgeConnection");

    host.stop().await;
}

#[tokio::test]
async fn foreign_session_id_is_bounced_without_hurting_the_active_one() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let _ack = client.recv().await;

    client.send(status_change("S2", "CONNECTED")).await;
    let bounce = client.recv().await;
    assert_eq!(bounce["Event"], "RequestSessionDisconnect");
    assert_eq!(bounce["SessionID"], "S2");

    // S1 is still the active session and the connection still works.
    client.send(status_change("S1", "WAITING")).await;
    let ready = client.recv().await;
    assert_eq!(ready["Event"], "MediaStreamIsReady");
    assert_eq!(ready["SessionID"], "S1");

    // The foreign status never reached the presenter.
    let saw_connected = host.presenter.calls().iter().any(|call| {
        matches!(call, PresenterCall::Status(SessionStatus::Connected))
    });
    assert!(!saw_connected);

    host.stop().await;
}

#[tokio::test]
async fn second_request_connection_is_rejected_while_first_is_active() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let _ack = client.recv().await;

    client.send(request_connection("S2", "C2", "1")).await;
    let bounce = client.recv().await;
    assert_eq!(bounce["Event"], "RequestSessionDisconnect");
    assert_eq!(bounce["SessionID"], "S2");

    client.send(status_change("S1", "WAITING")).await;
    assert_eq!(client.recv().await["Event"], "MediaStreamIsReady");

    host.stop().await;
}

#[tokio::test]
async fn client_initiated_disconnect_restarts_the_listener() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let _ack = client.recv().await;

    client.send(status_change("S1", "DISCONNECTED")).await;
    client.read_until_closed().await;

    // The first media stack is fully torn down and a second one built.
    host.factory.wait_for_builds(2).await;
    let first = host.factory.rpc(0);
    assert!(first.stopped());
    assert!(first.closed());

    // A fresh client can pair on the same endpoint.
    let mut next = TestClient::connect(host.addr).await;
    next.send(request_connection("S2", "C2", "1")).await;
    let ack = next.recv().await;
    assert_eq!(ack["Event"], "AcknowledgeConnection");
    assert_eq!(ack["SessionID"], "S2");

    let status = host.status();
    assert_eq!(status.bonjour, "Running");

    host.stop().await;
}

#[tokio::test]
async fn relisten_status_reads_stopped_listening() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let _ack = client.recv().await;
    client.send(status_change("S1", "DISCONNECTED")).await;
    client.read_until_closed().await;

    host.factory.wait_for_builds(2).await;
    host.wait_for_status(|status| status.session.starts_with("Stopped (Listening"))
        .await;

    host.stop().await;
}

#[tokio::test]
async fn zero_length_frame_is_ignored() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send_raw(b"").await;

    // The connection survived and a normal handshake still works.
    client.send(request_connection("S1", "C1", "1")).await;
    assert_eq!(client.recv().await["Event"], "AcknowledgeConnection");

    host.stop().await;
}

#[tokio::test]
async fn malformed_json_and_missing_fields_are_ignored() {
    let host = TestHost::start(false).await;
    let mut client = TestClient::connect(host.addr).await;

    client.send_raw(b"this is not json").await;
    client.send(json!({ "Event": "SessionStatusDidChange" })).await;
    client.send(json!({ "SessionID": "S1" })).await;

    client.send(request_connection("S1", "C1", "1")).await;
    assert_eq!(client.recv().await["Event"], "AcknowledgeConnection");

    host.stop().await;
}

#[tokio::test]
async fn rpc_failure_during_connect_bounces_the_session() {
    let host = TestHost::start(false).await;
    host.factory.fail_next_token();
    let mut client = TestClient::connect(host.addr).await;

    client.send(request_connection("S1", "C1", "1")).await;
    let reply = client.recv().await;
    assert_eq!(reply["Event"], "RequestSessionDisconnect");
    assert_eq!(reply["SessionID"], "S1");

    // Connection is still open; a retry succeeds once the RPC recovers.
    client.send(request_connection("S1", "C1", "1")).await;
    assert_eq!(client.recv().await["Event"], "AcknowledgeConnection");

    host.stop().await;
}

// -------------------------------------------------------------------
// host harness
// -------------------------------------------------------------------

struct TestHost {
    addr: SocketAddr,
    presenter: Arc<RecordingPresenter>,
    factory: Arc<FakeStackFactory>,
    status_rx: watch::Receiver<HostStatus>,
    shutdown: CancellationToken,
    run_task: JoinHandle<anyhow::Result<()>>,
}

impl TestHost {
    async fn start(force_barcode: bool) -> Self {
        let port = free_port().await;
        let config = Config {
            bundle_id: "com.x.y".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            port,
            force_barcode,
            media_service_version: "6.0.0".to_string(),
            media_service_executable: None,
            control_socket: None,
        };

        let presenter = Arc::new(RecordingPresenter::default());
        let factory = Arc::new(FakeStackFactory::default());
        let coordinator = Arc::new(Coordinator::new(
            config,
            SERVER_ID.to_string(),
            Arc::clone(&presenter) as Arc<dyn Presenter>,
            Arc::new(MemoryLogSink::new()),
            Arc::new(NullAdvertiser),
            Arc::clone(&factory) as Arc<dyn MediaStackFactory>,
        ));
        let status_rx = coordinator.status();

        let shutdown = CancellationToken::new();
        let run_task = {
            let coordinator = Arc::clone(&coordinator);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { coordinator.run(shutdown).await })
        };

        let addr = SocketAddr::new("127.0.0.1".parse().unwrap(), port);
        Self {
            addr,
            presenter,
            factory,
            status_rx,
            shutdown,
            run_task,
        }
    }

    fn status(&self) -> HostStatus {
        self.status_rx.borrow().clone()
    }

    async fn wait_for_status(&self, predicate: impl Fn(&HostStatus) -> bool) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if predicate(&self.status_rx.borrow()) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("status never matched; last: {:?}", self.status());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(RECV_TIMEOUT, self.run_task)
            .await
            .expect("coordinator stopped before timeout")
            .expect("run task joined");
        result.expect("coordinator exited cleanly");
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe listener");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    port
}

fn request_connection(session_id: &str, client_id: &str, version: &str) -> Value {
    json!({
        "Event": "RequestConnection",
        "ProtocolVersion": version,
        "StreamingProvider": "cloudxr",
        "StreamingProviderVersion": "6.0.0",
        "UserInterfaceIdiom": "headset",
        "SessionID": session_id,
        "ClientID": client_id,
    })
}

fn status_change(session_id: &str, status: &str) -> Value {
    json!({
        "Event": "SessionStatusDidChange",
        "SessionID": session_id,
        "Status": status,
    })
}

// -------------------------------------------------------------------
// wire client
// -------------------------------------------------------------------

struct TestClient {
    stream: TcpStream,
    cancel: CancellationToken,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    return Self {
                        stream,
                        cancel: CancellationToken::new(),
                    }
                }
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        panic!("connect to {addr} failed: {err}");
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    async fn send(&mut self, value: Value) {
        let bytes = serde_json::to_vec(&value).expect("encode frame");
        self.send_raw(&bytes).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        write_frame(&mut self.stream, bytes, &self.cancel)
            .await
            .expect("write frame");
    }

    async fn recv(&mut self) -> Value {
        let payload = tokio::time::timeout(RECV_TIMEOUT, read_frame(&mut self.stream, &self.cancel))
            .await
            .expect("frame before timeout")
            .expect("read frame");
        serde_json::from_str(&payload).expect("frame is JSON")
    }

    async fn recv_err(&mut self) -> FrameError {
        tokio::time::timeout(RECV_TIMEOUT, read_frame(&mut self.stream, &self.cancel))
            .await
            .expect("close before timeout")
            .expect_err("expected stream end")
    }

    /// Drain best-effort replies until the host closes the connection.
    async fn read_until_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let read = tokio::time::timeout_at(
                deadline,
                read_frame(&mut self.stream, &self.cancel),
            )
            .await;
            match read {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return,
                Err(_) => panic!("host never closed the connection"),
            }
        }
    }
}

// -------------------------------------------------------------------
// media stack fake
// -------------------------------------------------------------------

#[derive(Default)]
struct FakeRpcState {
    started_versions: Vec<String>,
    stopped: bool,
    closed: bool,
    fail_next_token: bool,
    service: MediaServiceState,
}

#[derive(Default)]
struct FakeRpc {
    state: Mutex<FakeRpcState>,
}

impl FakeRpc {
    fn started_versions(&self) -> Vec<String> {
        self.state.lock().unwrap().started_versions.clone()
    }

    fn runtime_running(&self) -> bool {
        self.state.lock().unwrap().service.open_xr_runtime_running
    }

    fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

#[async_trait]
impl MediaServiceRpc for FakeRpc {
    async fn connect(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn start_service(&self, version: &str) -> Result<(), RpcError> {
        let mut state = self.state.lock().unwrap();
        state.started_versions.push(version.to_string());
        state.service.open_xr_runtime_running = true;
        Ok(())
    }

    async fn stop_service(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.service = MediaServiceState::default();
        Ok(())
    }

    async fn query_status(&self) -> Result<Option<MediaServiceState>, RpcError> {
        let state = self.state.lock().unwrap();
        if state.started_versions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(state.service))
        }
    }

    async fn issue_client_token(&self, client_id: &str) -> Result<String, RpcError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_token {
            state.fail_next_token = false;
            return Err(RpcError::CallFailed("token service offline".into()));
        }
        Ok(format!("token-{client_id}"))
    }

    async fn certificate_fingerprint(&self) -> Result<String, RpcError> {
        Ok("F1".to_string())
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
struct FakeStackFactory {
    rpcs: Mutex<Vec<Arc<FakeRpc>>>,
    fail_next_token: Mutex<bool>,
}

impl FakeStackFactory {
    fn rpc(&self, index: usize) -> Arc<FakeRpc> {
        Arc::clone(&self.rpcs.lock().unwrap()[index])
    }

    fn fail_next_token(&self) {
        if let Some(rpc) = self.rpcs.lock().unwrap().last() {
            rpc.state.lock().unwrap().fail_next_token = true;
        } else {
            *self.fail_next_token.lock().unwrap() = true;
        }
    }

    async fn wait_for_builds(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if self.rpcs.lock().unwrap().len() >= count {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "expected {count} stack builds, saw {}",
                    self.rpcs.lock().unwrap().len()
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl MediaStackFactory for FakeStackFactory {
    async fn build(&self, _sink: Arc<dyn LogSink>) -> anyhow::Result<MediaStack> {
        let rpc = Arc::new(FakeRpc::default());
        if std::mem::take(&mut *self.fail_next_token.lock().unwrap()) {
            rpc.state.lock().unwrap().fail_next_token = true;
        }
        self.rpcs.lock().unwrap().push(Arc::clone(&rpc));
        Ok(MediaStack {
            supervisor: None,
            rpc,
        })
    }
}

// -------------------------------------------------------------------
// presenter fake
// -------------------------------------------------------------------

#[derive(Debug, Clone)]
enum PresenterCall {
    Barcode(BarcodePayload),
    Status(SessionStatus),
    BarcodeRequested(SessionInformation),
    ConnectionError(String),
}

#[derive(Default)]
struct RecordingPresenter {
    calls: Mutex<Vec<PresenterCall>>,
}

impl RecordingPresenter {
    fn calls(&self) -> Vec<PresenterCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn wait_for(&self, predicate: impl Fn(&[PresenterCall]) -> bool) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if predicate(&self.calls()) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("presenter never observed the expected call; saw {:?}", self.calls());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Presenter for RecordingPresenter {
    fn generate_barcode(&self, payload: &BarcodePayload) {
        self.calls
            .lock()
            .unwrap()
            .push(PresenterCall::Barcode(payload.clone()));
    }

    fn session_status_did_change(&self, status: SessionStatus) {
        self.calls
            .lock()
            .unwrap()
            .push(PresenterCall::Status(status));
    }

    fn barcode_presentation_requested(&self, session: &SessionInformation) {
        self.calls
            .lock()
            .unwrap()
            .push(PresenterCall::BarcodeRequested(session.clone()));
    }

    fn connection_error_occurred(&self, message: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(PresenterCall::ConnectionError(message.to_string()));
    }
}

struct NullAdvertiser;

impl ServiceAdvertiser for NullAdvertiser {
    fn advertise(&self, _registration: &ServiceRegistration) -> Result<(), AdvertiseError> {
        Ok(())
    }

    fn close(&self) {}
}
