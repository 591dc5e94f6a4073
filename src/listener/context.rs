//! Request/response pairing for one accepted connection.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use uuid::Uuid;

/// Header consulted for the originating client address when the server sits
/// behind a reverse proxy.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The inbound half of an accepted connection.
pub trait HttpRequest: Send {
    fn method(&self) -> &Method;

    /// Path and query exactly as received, e.g. `/Radar/AircraftList.json?x=1`.
    fn raw_url(&self) -> &str;

    fn headers(&self) -> &HeaderMap;

    /// Transport-level peer address.
    fn peer_addr(&self) -> SocketAddr;
}

/// The outbound half of an accepted connection.
///
/// Writes are buffered by the provider until `close`, which sends the
/// response downstream. `close` is idempotent; the first call wins.
pub trait HttpResponse: Send {
    fn status(&self) -> StatusCode;
    fn set_status(&mut self, status: StatusCode);
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    /// Opt this response into compression. Whether compression actually
    /// happens also depends on the server-level flag and the client's
    /// `Accept-Encoding`.
    fn enable_compression(&mut self, enabled: bool);
    fn compression_enabled(&self) -> bool;

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Payload bytes handed to `write` so far.
    fn bytes_written(&self) -> u64;

    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

/// Broad content categories for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentClassification {
    Audio,
    Html,
    Image,
    Json,
    #[default]
    Other,
}

/// One accepted request and its response sink.
///
/// Created per accepted connection and destroyed once the response-sent
/// event has fired.
pub struct RequestContext {
    pub request: Box<dyn HttpRequest>,
    pub response: Box<dyn HttpResponse>,
    id: Uuid,
    handled: bool,
    classification: ContentClassification,
    started: Option<Instant>,
}

impl RequestContext {
    pub fn new(request: Box<dyn HttpRequest>, response: Box<dyn HttpResponse>) -> Self {
        Self {
            request,
            response,
            id: Uuid::new_v4(),
            handled: false,
            classification: ContentClassification::default(),
            started: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether any pipeline stage has claimed this request.
    pub fn handled(&self) -> bool {
        self.handled
    }

    pub fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    pub fn classification(&self) -> ContentClassification {
        self.classification
    }

    pub fn set_classification(&mut self, classification: ContentClassification) {
        self.classification = classification;
    }

    pub fn started(&self) -> Option<Instant> {
        self.started
    }

    pub fn set_started(&mut self, at: Instant) {
        self.started = Some(at);
    }

    /// Client address for telemetry: the first valid entry of
    /// `X-Forwarded-For` when present, the transport peer otherwise.
    pub fn client_address(&self) -> IpAddr {
        self.request
            .headers()
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .find_map(|entry| entry.parse::<IpAddr>().ok())
            })
            .unwrap_or_else(|| self.request.peer_addr().ip())
    }
}
