//! In-memory transport fakes for exercising the request pipeline.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::{mpsc, watch};

use crate::listener::context::{HttpRequest, HttpResponse, RequestContext};
use crate::listener::provider::{AcceptError, ListenerError, ListenerProvider};

pub(crate) struct FakeRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub peer: SocketAddr,
}

impl FakeRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: Method::GET,
            url: url.to_string(),
            headers: HeaderMap::new(),
            peer: "192.0.2.10:51000".parse().unwrap(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        self.headers.insert(name, HeaderValue::from_str(value).unwrap());
        self
    }
}

impl HttpRequest for FakeRequest {
    fn method(&self) -> &Method {
        &self.method
    }

    fn raw_url(&self) -> &str {
        &self.url
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Everything a fake response sink saw, shared with the test.
#[derive(Debug, Default)]
pub(crate) struct RecordedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub compression_enabled: bool,
    pub close_count: u32,
}

impl RecordedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) struct FakeResponse {
    record: Arc<Mutex<RecordedResponse>>,
    status: StatusCode,
    compression: bool,
    bytes_written: u64,
    closed: bool,
}

impl FakeResponse {
    pub fn new() -> (Self, Arc<Mutex<RecordedResponse>>) {
        let record = Arc::new(Mutex::new(RecordedResponse {
            status: 200,
            ..RecordedResponse::default()
        }));
        (
            Self {
                record: Arc::clone(&record),
                status: StatusCode::OK,
                compression: false,
                bytes_written: 0,
                closed: false,
            },
            record,
        )
    }
}

impl HttpResponse for FakeResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
        self.record.lock().unwrap().status = status.as_u16();
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.record.lock().unwrap().headers.push((
            name.as_str().to_string(),
            value.to_str().unwrap_or_default().to_string(),
        ));
    }

    fn enable_compression(&mut self, enabled: bool) {
        self.compression = enabled;
        self.record.lock().unwrap().compression_enabled = enabled;
    }

    fn compression_enabled(&self) -> bool {
        self.compression
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.bytes_written += bytes.len() as u64;
        self.record.lock().unwrap().body.extend_from_slice(bytes);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.record.lock().unwrap().close_count += 1;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Scripted accept outcome for [`FakeProvider`].
pub(crate) enum FakeAccept {
    Context(RequestContext),
    Error(AcceptError),
}

/// In-memory provider: tests push contexts or errors, the server pulls them
/// through `accept` exactly as it would from a socket.
pub(crate) struct FakeProvider {
    queue_tx: mpsc::UnboundedSender<FakeAccept>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeAccept>>,
    listening: watch::Sender<bool>,
    prefix: Mutex<Option<String>>,
    compression: AtomicBool,
    pub start_calls: AtomicU32,
    pub stop_calls: AtomicU32,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (listening, _) = watch::channel(false);
        Arc::new(Self {
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            listening,
            prefix: Mutex::new(None),
            compression: AtomicBool::new(true),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        })
    }

    pub fn prefix(&self) -> Option<String> {
        self.prefix.lock().unwrap().clone()
    }

    /// Queue a request for the server; the shared record lets the test watch
    /// what happened to the response.
    pub fn push_request(&self, request: FakeRequest) -> Arc<Mutex<RecordedResponse>> {
        let (response, record) = FakeResponse::new();
        let context = RequestContext::new(Box::new(request), Box::new(response));
        self.queue_tx
            .send(FakeAccept::Context(context))
            .expect("provider queue closed");
        record
    }

    pub fn push_error(&self, error: AcceptError) {
        self.queue_tx
            .send(FakeAccept::Error(error))
            .expect("provider queue closed");
    }
}

#[async_trait]
impl ListenerProvider for FakeProvider {
    fn set_prefix(&self, prefix: &str) -> Result<(), ListenerError> {
        *self.prefix.lock().unwrap() = Some(prefix.to_string());
        Ok(())
    }

    async fn start(&self) -> Result<(), ListenerError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.listening.send_replace(true);
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.listening.send_replace(false);
    }

    fn is_listening(&self) -> bool {
        *self.listening.borrow()
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.is_listening()
            .then(|| "127.0.0.1:8080".parse().unwrap())
    }

    fn set_compression_enabled(&self, enabled: bool) {
        self.compression.store(enabled, Ordering::SeqCst);
    }

    async fn accept(&self) -> Result<RequestContext, AcceptError> {
        let mut queue = self.queue_rx.lock().await;
        let mut listening = self.listening.subscribe();
        tokio::select! {
            item = queue.recv() => match item {
                Some(FakeAccept::Context(context)) => Ok(context),
                Some(FakeAccept::Error(error)) => Err(error),
                None => Err(AcceptError::ListenerGone),
            },
            _ = listening.wait_for(|on| !*on) => Err(AcceptError::ListenerClosed),
        }
    }
}

/// Poll until `condition` holds or a short timeout expires.
pub(crate) async fn wait_until<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    condition()
}
