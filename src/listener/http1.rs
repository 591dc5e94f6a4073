//! HTTP/1.1 transport over a TCP accept loop.
//!
//! # Responsibilities
//! - Bind to the port named by the listener prefix
//! - Accept TCP connections and parse requests with hyper
//! - Buffer response writes, apply gzip when allowed, send on close
//!
//! # Design Decisions
//! - Each parsed request is queued as a context; the hyper service waits on
//!   a oneshot until the context's response sink is closed
//! - Request bodies are not consumed; the served API is GET-shaped

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::listener::context::{HttpRequest, HttpResponse, RequestContext};
use crate::listener::provider::{AcceptError, ListenerError, ListenerProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Prefix {
    port: u16,
    root: String,
}

/// The production listener transport.
pub struct Http1Provider {
    bind_ip: IpAddr,
    prefix: Mutex<Option<Prefix>>,
    listening: watch::Sender<bool>,
    compression: Arc<AtomicBool>,
    bound: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    queue_tx: mpsc::Sender<RequestContext>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<RequestContext>>,
}

impl Http1Provider {
    pub fn new() -> Self {
        Self::bound_to(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Bind to a specific local address instead of all interfaces.
    pub fn bound_to(bind_ip: IpAddr) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(256);
        let (listening, _) = watch::channel(false);
        Self {
            bind_ip,
            prefix: Mutex::new(None),
            listening,
            compression: Arc::new(AtomicBool::new(true)),
            bound: Mutex::new(None),
            shutdown: Mutex::new(None),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
        }
    }
}

impl Default for Http1Provider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListenerProvider for Http1Provider {
    fn set_prefix(&self, prefix: &str) -> Result<(), ListenerError> {
        let parsed = parse_prefix(prefix)?;
        *self.prefix.lock().unwrap() = Some(parsed);
        Ok(())
    }

    async fn start(&self) -> Result<(), ListenerError> {
        let prefix = self
            .prefix
            .lock()
            .unwrap()
            .clone()
            .ok_or(ListenerError::PrefixNotSet)?;

        let addr = SocketAddr::new(self.bind_ip, prefix.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        *self.bound.lock().unwrap() = Some(local);

        // Requests queued before a previous stop belong to dead connections.
        if let Ok(mut queue) = self.queue_rx.try_lock() {
            while queue.try_recv().is_ok() {}
        }

        let (shutdown_tx, mut shutdown) = broadcast::channel(1);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        self.listening.send_replace(true);

        let queue = self.queue_tx.clone();
        let compression = Arc::clone(&self.compression);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let queue = queue.clone();
                            let compression = Arc::clone(&compression);
                            tokio::spawn(serve_connection(stream, peer, queue, compression));
                        }
                        Err(error) => {
                            tracing::warn!(%error, "TCP accept failed");
                        }
                    },
                }
            }
            tracing::debug!(address = %local, "Listener socket closed");
        });

        tracing::info!(address = %local, root = %prefix.root, "Listener bound");
        Ok(())
    }

    fn stop(&self) {
        self.listening.send_replace(false);
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(());
        }
    }

    fn is_listening(&self) -> bool {
        *self.listening.borrow()
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    fn set_compression_enabled(&self, enabled: bool) {
        self.compression.store(enabled, Ordering::Relaxed);
    }

    async fn accept(&self) -> Result<RequestContext, AcceptError> {
        let mut queue = self.queue_rx.lock().await;
        let mut listening = self.listening.subscribe();
        tokio::select! {
            context = queue.recv() => context.ok_or(AcceptError::ListenerGone),
            _ = listening.wait_for(|on| !*on) => Err(AcceptError::ListenerClosed),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    queue: mpsc::Sender<RequestContext>,
    compression: Arc<AtomicBool>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |request: Request<Incoming>| {
        let queue = queue.clone();
        let compression = Arc::clone(&compression);
        async move { Ok::<_, Infallible>(dispatch(request, peer, queue, compression).await) }
    });

    if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!(%error, %peer, "Connection closed with error");
    }
}

/// Queue the parsed request and wait for its sink to be closed.
async fn dispatch(
    request: Request<Incoming>,
    peer: SocketAddr,
    queue: mpsc::Sender<RequestContext>,
    compression: Arc<AtomicBool>,
) -> Response<Full<Bytes>> {
    let accepts_gzip = request
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("gzip"))
        .unwrap_or(false);

    let (parts, _body) = request.into_parts();
    let raw_url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let (reply_tx, reply_rx) = oneshot::channel();
    let http_request = Http1Request {
        method: parts.method,
        raw_url,
        headers: parts.headers,
        peer,
    };
    let sink = Http1Response::new(reply_tx, accepts_gzip, compression);
    let context = RequestContext::new(Box::new(http_request), Box::new(sink));

    if queue.send(context).await.is_err() {
        return status_only(StatusCode::SERVICE_UNAVAILABLE);
    }
    match reply_rx.await {
        Ok(response) => response,
        Err(_) => status_only(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

struct Http1Request {
    method: Method,
    raw_url: String,
    headers: HeaderMap,
    peer: SocketAddr,
}

impl HttpRequest for Http1Request {
    fn method(&self) -> &Method {
        &self.method
    }

    fn raw_url(&self) -> &str {
        &self.raw_url
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

struct Http1Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    bytes_written: u64,
    compress_requested: bool,
    accepts_gzip: bool,
    compression_allowed: Arc<AtomicBool>,
    reply: Option<oneshot::Sender<Response<Full<Bytes>>>>,
}

impl Http1Response {
    fn new(
        reply: oneshot::Sender<Response<Full<Bytes>>>,
        accepts_gzip: bool,
        compression_allowed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            bytes_written: 0,
            compress_requested: false,
            accepts_gzip,
            compression_allowed,
            reply: Some(reply),
        }
    }
}

impl HttpResponse for Http1Response {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    fn enable_compression(&mut self, enabled: bool) {
        self.compress_requested = enabled;
    }

    fn compression_enabled(&self) -> bool {
        self.compress_requested
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.bytes_written += bytes.len() as u64;
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn close(&mut self) {
        let Some(reply) = self.reply.take() else {
            return;
        };

        let mut body = std::mem::take(&mut self.body);
        if self.compress_requested
            && self.accepts_gzip
            && self.compression_allowed.load(Ordering::Relaxed)
            && !body.is_empty()
        {
            match gzip(&body) {
                Ok(compressed) if compressed.len() < body.len() => {
                    self.headers.insert(
                        header::CONTENT_ENCODING,
                        HeaderValue::from_static("gzip"),
                    );
                    body = compressed;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!(%error, "Compression failed, sending identity");
                }
            }
        }
        self.headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len() as u64));

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        let _ = reply.send(response);
    }

    fn is_closed(&self) -> bool {
        self.reply.is_none()
    }
}

impl Drop for Http1Response {
    fn drop(&mut self) {
        // A sink dropped without close means the request was abandoned.
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(status_only(StatusCode::INTERNAL_SERVER_ERROR));
        }
    }
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn parse_prefix(prefix: &str) -> Result<Prefix, ListenerError> {
    let invalid = || ListenerError::InvalidPrefix(prefix.to_string());

    let rest = prefix.strip_prefix("http://").ok_or_else(invalid)?;
    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    let (_host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;

    let trimmed = path.trim_matches('/');
    let root = if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    };

    Ok(Prefix { port, root })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn prefix_parses_port_and_root() {
        assert_eq!(
            parse_prefix("http://*:91/A/").unwrap(),
            Prefix {
                port: 91,
                root: "/A".to_string()
            }
        );
        assert_eq!(
            parse_prefix("http://*:8080/").unwrap(),
            Prefix {
                port: 8080,
                root: "/".to_string()
            }
        );
        assert_eq!(
            parse_prefix("http://+:80/Radar/Feeds/").unwrap(),
            Prefix {
                port: 80,
                root: "/Radar/Feeds".to_string()
            }
        );
    }

    #[test]
    fn bad_prefixes_are_rejected() {
        assert!(parse_prefix("https://*:91/").is_err());
        assert!(parse_prefix("http://*/").is_err());
        assert!(parse_prefix("http://*:notaport/").is_err());
    }

    #[tokio::test]
    async fn close_sends_the_buffered_response() {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut sink = Http1Response::new(reply_tx, false, Arc::new(AtomicBool::new(true)));

        sink.set_status(StatusCode::OK);
        sink.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        sink.write(b"hello").unwrap();
        sink.close();
        sink.close(); // second close is a no-op

        let response = reply_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_LENGTH).unwrap(),
            "5"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[tokio::test]
    async fn compression_applies_only_when_everyone_agrees() {
        let payload = vec![b'a'; 4096];

        // Opted in, client accepts gzip, server allows it.
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut sink = Http1Response::new(reply_tx, true, Arc::new(AtomicBool::new(true)));
        sink.enable_compression(true);
        sink.write(&payload).unwrap();
        sink.close();
        let response = reply_rx.await.unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );

        // Client never offered gzip.
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut sink = Http1Response::new(reply_tx, false, Arc::new(AtomicBool::new(true)));
        sink.enable_compression(true);
        sink.write(&payload).unwrap();
        sink.close();
        let response = reply_rx.await.unwrap();
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());

        // Server-level switch wins over the per-response opt-in.
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut sink = Http1Response::new(reply_tx, true, Arc::new(AtomicBool::new(false)));
        sink.enable_compression(true);
        sink.write(&payload).unwrap();
        sink.close();
        let response = reply_rx.await.unwrap();
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[test]
    fn gzip_output_decodes_back() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let compressed = gzip(payload).unwrap();

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
