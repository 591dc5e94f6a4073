//! The embedded web server.
//!
//! # Responsibilities
//! - Own the Offline/Online lifecycle and the listener prefix
//! - Run the accept loop: one outstanding accept, pipelined request handling
//! - Authenticate requests and cache validated Basic credentials
//! - Fire the ordered request events and response-sent telemetry
//!
//! # Design Decisions
//! - Transient disconnects are recovered silently; anything else surfaces
//!   through the exception event and never kills the process
//! - The response sink is closed exactly once on every exit path

use std::net::IpAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use http::{header, HeaderValue, StatusCode};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::events::{EventHandlers, HandlerError, PipelineHandlers};
use crate::listener::auth::{
    parse_basic_credentials, AuthenticationArgs, AuthenticationScheme, CredentialCache,
};
use crate::listener::context::{
    ContentClassification, HttpRequest, HttpResponse, RequestContext,
};
use crate::listener::provider::{AcceptError, ListenerError, ListenerProvider};
use uuid::Uuid;

/// Realm announced in Basic challenges.
const REALM: &str = "portside";

/// Error type for server operations, also the payload of the exception event.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("accepting a connection failed: {0}")]
    Accept(#[source] AcceptError),

    #[error("request {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: HandlerError,
    },

    #[error("authentication scheme {0} is not supported")]
    UnsupportedScheme(AuthenticationScheme),

    #[error("response-sent handler failed: {0}")]
    Telemetry(#[source] HandlerError),
}

/// Telemetry for one completed request.
#[derive(Debug)]
pub struct ResponseSentArgs {
    /// Path relative to the configured site root.
    pub url_requested: String,
    /// Payload bytes written to the response.
    pub bytes_sent: u64,
    pub classification: ContentClassification,
    /// Originating client: `X-Forwarded-For` when present, transport peer
    /// otherwise.
    pub address: IpAddr,
    /// Transport-level peer port.
    pub port: u16,
    pub status: StatusCode,
    /// Wall time from accept to response, on the injected clock.
    pub elapsed: Duration,
    pub request_id: Uuid,
}

/// Events the server exposes to the application.
#[derive(Default)]
pub struct ServerEvents {
    pub online_changed: EventHandlers<bool>,
    pub external_address_changed: EventHandlers<Option<String>>,
    pub before_request_received: PipelineHandlers<RequestContext>,
    pub request_received: PipelineHandlers<RequestContext>,
    pub after_request_received: PipelineHandlers<RequestContext>,
    pub response_sent: PipelineHandlers<ResponseSentArgs>,
    pub authentication_required: EventHandlers<AuthenticationArgs>,
    pub exception_caught: EventHandlers<ServerError>,
}

struct ServerState {
    root: String,
    port: u16,
    external_port: u16,
    external_ip: Option<IpAddr>,
    external_address: Option<String>,
    scheme: AuthenticationScheme,
    cache_credentials: bool,
    network_address: Option<IpAddr>,
    online: bool,
    shutdown: Option<broadcast::Sender<()>>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            root: "/".to_string(),
            port: 8080,
            external_port: 8080,
            external_ip: None,
            external_address: None,
            scheme: AuthenticationScheme::Anonymous,
            cache_credentials: false,
            network_address: None,
            online: false,
            shutdown: None,
        }
    }
}

enum AuthOutcome {
    /// Request may proceed into the pipeline.
    Allowed,
    /// A 401 challenge was sent; the request receives no further processing.
    Challenged,
    /// The configured scheme cannot be served.
    Unsupported,
}

/// The embedded web server: lifecycle, accept loop, request pipeline.
pub struct WebServer {
    /// Handle to ourselves for spawning the accept loop.
    me: Weak<WebServer>,
    provider: Arc<dyn ListenerProvider>,
    clock: Arc<dyn Clock>,
    state: Mutex<ServerState>,
    credentials: CredentialCache,
    pub events: ServerEvents,
}

impl WebServer {
    pub fn new(provider: Arc<dyn ListenerProvider>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            provider,
            clock,
            state: Mutex::new(ServerState::default()),
            credentials: CredentialCache::new(),
            events: ServerEvents::default(),
        })
    }

    // ---- properties -----------------------------------------------------

    /// Site root. Stored with exactly one leading slash and no trailing
    /// slash; the bare root is `/`.
    pub fn root(&self) -> String {
        self.state.lock().unwrap().root.clone()
    }

    pub fn set_root(&self, root: &str) {
        self.state.lock().unwrap().root = normalize_root(root);
        // The root is part of the computed external address.
        self.refresh_external_address();
    }

    pub fn port(&self) -> u16 {
        self.state.lock().unwrap().port
    }

    /// Changing the port does not touch a running listener; the prefix is
    /// recomputed on the next transition to online.
    pub fn set_port(&self, port: u16) {
        self.state.lock().unwrap().port = port;
    }

    pub fn external_port(&self) -> u16 {
        self.state.lock().unwrap().external_port
    }

    pub fn set_external_port(&self, port: u16) {
        self.state.lock().unwrap().external_port = port;
        self.refresh_external_address();
    }

    pub fn external_ip(&self) -> Option<IpAddr> {
        self.state.lock().unwrap().external_ip
    }

    pub fn set_external_ip(&self, address: Option<IpAddr>) {
        self.state.lock().unwrap().external_ip = address;
        self.refresh_external_address();
    }

    /// Address of the server as seen from the Internet, when known.
    pub fn external_address(&self) -> Option<String> {
        self.state.lock().unwrap().external_address.clone()
    }

    /// LAN address of the machine, used as the internal client of a router
    /// port mapping.
    pub fn network_address(&self) -> Option<IpAddr> {
        self.state.lock().unwrap().network_address
    }

    pub fn set_network_address(&self, address: Option<IpAddr>) {
        self.state.lock().unwrap().network_address = address;
    }

    pub fn scheme(&self) -> AuthenticationScheme {
        self.state.lock().unwrap().scheme
    }

    pub fn set_scheme(&self, scheme: AuthenticationScheme) {
        self.state.lock().unwrap().scheme = scheme;
    }

    pub fn cache_credentials(&self) -> bool {
        self.state.lock().unwrap().cache_credentials
    }

    /// Turning caching off discards everything already remembered.
    pub fn set_cache_credentials(&self, enabled: bool) {
        self.state.lock().unwrap().cache_credentials = enabled;
        if !enabled {
            self.credentials.clear();
        }
    }

    pub fn reset_credential_cache(&self) {
        self.credentials.clear();
    }

    pub fn set_compression_enabled(&self, enabled: bool) {
        self.provider.set_compression_enabled(enabled);
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().unwrap().online
    }

    /// The listener prefix the current configuration produces.
    pub fn prefix(&self) -> String {
        let state = self.state.lock().unwrap();
        prefix_for(state.port, &state.root)
    }

    pub fn provider(&self) -> &Arc<dyn ListenerProvider> {
        &self.provider
    }

    // ---- lifecycle ------------------------------------------------------

    /// Bring the listener online or take it offline. Repeating the current
    /// state is a no-op.
    pub async fn set_online(&self, online: bool) -> Result<(), ServerError> {
        if online {
            self.go_online().await
        } else {
            self.go_offline();
            Ok(())
        }
    }

    async fn go_online(&self) -> Result<(), ServerError> {
        let prefix = {
            let state = self.state.lock().unwrap();
            if state.online {
                return Ok(());
            }
            prefix_for(state.port, &state.root)
        };

        self.provider.set_prefix(&prefix)?;
        self.provider.start().await?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        {
            let mut state = self.state.lock().unwrap();
            state.online = true;
            state.shutdown = Some(shutdown_tx);
        }

        // The weak handle only fails during teardown, when there is nobody
        // left to serve.
        if let Some(server) = self.me.upgrade() {
            tokio::spawn(async move {
                server.accept_loop(shutdown_rx).await;
            });
        }

        tracing::info!(%prefix, "Web server online");
        self.events.online_changed.raise(&mut true);
        Ok(())
    }

    fn go_offline(&self) {
        let shutdown = {
            let mut state = self.state.lock().unwrap();
            if !state.online {
                return;
            }
            state.online = false;
            state.shutdown.take()
        };

        self.provider.stop();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }

        tracing::info!("Web server offline");
        self.events.online_changed.raise(&mut false);
    }

    // ---- accept loop ----------------------------------------------------

    async fn accept_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let context = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.provider.accept() => match accepted {
                    Ok(context) => context,
                    Err(AcceptError::ListenerClosed) => {
                        if self.provider.is_listening() {
                            continue;
                        }
                        break;
                    }
                    Err(AcceptError::ListenerGone) => break,
                    Err(error @ AcceptError::Fatal(_)) => {
                        self.raise_exception(ServerError::Accept(error));
                        break;
                    }
                },
            };

            // Stopped between completion and dispatch: discard, stop.
            if !self.provider.is_listening() {
                let mut context = context;
                context.response.close();
                break;
            }

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.process(context);
            });
        }
        tracing::debug!("Accept loop stopped");
    }

    // ---- request processing ---------------------------------------------

    fn process(&self, mut context: RequestContext) {
        context.set_started(self.clock.now());
        let request_id = context.id();
        let url = context.request.raw_url().to_string();
        tracing::debug!(%request_id, %url, "Request received");

        match self.authenticate(&mut context) {
            AuthOutcome::Allowed => {}
            AuthOutcome::Challenged => {
                tracing::debug!(%request_id, "Basic challenge sent");
                return;
            }
            AuthOutcome::Unsupported => {
                let scheme = self.scheme();
                context.response.close();
                self.raise_exception(ServerError::UnsupportedScheme(scheme));
                return;
            }
        }

        match self.run_pipeline(&mut context) {
            Ok(()) => {}
            Err(error) if is_disconnect_error(error.as_ref()) => {
                tracing::debug!(%request_id, %error, "Peer disconnected mid-request");
            }
            Err(error) => {
                self.raise_exception(ServerError::Request { url, source: error });
            }
        }
        context.response.close();

        self.raise_response_sent(&context);
    }

    fn run_pipeline(&self, context: &mut RequestContext) -> Result<(), HandlerError> {
        self.events.before_request_received.raise(context)?;
        self.events.request_received.raise(context)?;
        if !context.handled() {
            context.response.set_status(StatusCode::NOT_FOUND);
        }
        self.events.after_request_received.raise(context)?;
        Ok(())
    }

    fn authenticate(&self, context: &mut RequestContext) -> AuthOutcome {
        let (scheme, cache_enabled) = {
            let state = self.state.lock().unwrap();
            (state.scheme, state.cache_credentials)
        };

        match scheme {
            AuthenticationScheme::None | AuthenticationScheme::Anonymous => AuthOutcome::Allowed,
            AuthenticationScheme::Digest => AuthOutcome::Unsupported,
            AuthenticationScheme::Basic => {
                let address = context.request.peer_addr().ip();
                let (user, password) =
                    parse_basic_credentials(context.request.headers()).unwrap_or_default();
                let key = (address, user.clone(), password.clone());

                if cache_enabled && self.credentials.is_valid(&key) {
                    return AuthOutcome::Allowed;
                }

                let mut args = AuthenticationArgs {
                    address,
                    user,
                    password,
                    is_authenticated: false,
                };
                self.events.authentication_required.raise(&mut args);

                if args.is_authenticated {
                    if cache_enabled {
                        self.credentials.remember(key);
                    }
                    AuthOutcome::Allowed
                } else {
                    context.response.set_status(StatusCode::UNAUTHORIZED);
                    if let Ok(value) =
                        HeaderValue::from_str(&format!("Basic Realm=\"{REALM}\""))
                    {
                        context.response.set_header(header::WWW_AUTHENTICATE, value);
                    }
                    context.response.close();
                    AuthOutcome::Challenged
                }
            }
        }
    }

    fn raise_response_sent(&self, context: &RequestContext) {
        let root = self.root();
        let elapsed = context
            .started()
            .map(|started| self.clock.now().saturating_duration_since(started))
            .unwrap_or_default();

        let mut args = ResponseSentArgs {
            url_requested: root_relative_path(&root, context.request.raw_url()),
            bytes_sent: context.response.bytes_written(),
            classification: context.classification(),
            address: context.client_address(),
            port: context.request.peer_addr().port(),
            status: context.response.status(),
            elapsed,
            request_id: context.id(),
        };

        if let Err(error) = self.events.response_sent.raise(&mut args) {
            self.raise_exception(ServerError::Telemetry(error));
        }
    }

    fn raise_exception(&self, mut error: ServerError) {
        tracing::warn!(error = %error, "Server exception");
        self.events.exception_caught.raise(&mut error);
    }

    fn refresh_external_address(&self) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let computed = state
                .external_ip
                .map(|ip| format!("http://{}:{}{}", ip, state.external_port, state.root));
            if computed == state.external_address {
                None
            } else {
                state.external_address = computed.clone();
                Some(computed)
            }
        };
        if let Some(mut address) = changed {
            self.events.external_address_changed.raise(&mut address);
        }
    }
}

/// Exactly one leading slash, no trailing slash, bare root is `/`.
fn normalize_root(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn prefix_for(port: u16, root: &str) -> String {
    let suffix = if root.ends_with('/') { "" } else { "/" };
    format!("http://*:{port}{root}{suffix}")
}

/// Path relative to the site root, query string stripped.
fn root_relative_path(root: &str, raw_url: &str) -> String {
    let path = raw_url.split(['?', '#']).next().unwrap_or(raw_url);
    if root == "/" {
        return path.to_string();
    }
    let relative = match path.get(..root.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(root) => &path[root.len()..],
        _ => path,
    };
    if relative.starts_with('/') {
        relative.to_string()
    } else {
        format!("/{relative}")
    }
}

/// Peer-went-away errors raised by handlers are expected and swallowed.
fn is_disconnect_error(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            );
        }
        current = e.source();
    }
    false
}
