//! WebSocket connection to the central system
//!
//! Handles:
//! - WebSocket connection with the `ocpp1.6` subprotocol
//! - TLS client credentials from the keystore for `wss://` URLs
//! - A single reader/writer task per open transport
//! - Routing of decoded frames to the correlator or the inbound call router
//!
//! A [`Connection`] is reusable: `close` followed by `connect` (or
//! `reconnect`) opens a fresh transport to the same URL under the same
//! identity, and the correlator replays whatever was in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::correlation::Correlator;
use super::messages::{Call, CallError, ErrorCode, OcppError, OcppMessage};
use crate::collab::{ConsoleEvent, ConsoleSink, KeyStore, TelemetrySink};
use crate::config::ChargePointConfig;

/// OCPP 1.6 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

const LOGGER: &str = "ocpp::connection";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

/// Receives central-system initiated calls
pub trait CallRouter: Send + Sync + 'static {
    fn route(self: Arc<Self>, call: Call);
}

type CloseCallback = Arc<dyn Fn() + Send + Sync>;

struct Link {
    state: ConnectionState,
    instance: u64,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Resets `Connecting` to `Disconnected` unless the handshake completed
struct ConnectAttempt<'a> {
    link: &'a Mutex<Link>,
}

impl ConnectAttempt<'_> {
    fn complete(self) {
        std::mem::forget(self);
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        let mut link = self.link.lock();
        if link.state == ConnectionState::Connecting {
            link.state = ConnectionState::Disconnected;
        }
    }
}

/// The collaborators a connection reports to
pub struct Observers {
    pub console: Arc<dyn ConsoleSink>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub keystore: Arc<dyn KeyStore>,
}

/// Connection record for one charge point identity
pub struct Connection {
    config: ChargePointConfig,
    correlator: Arc<Correlator>,
    router: Weak<dyn CallRouter>,
    observers: Observers,
    /// Per-identity count of transports opened so far
    instances: AtomicU64,
    link: Mutex<Link>,
    on_close: RwLock<Option<CloseCallback>>,
}

impl Connection {
    pub fn new(
        config: ChargePointConfig,
        correlator: Arc<Correlator>,
        router: Weak<dyn CallRouter>,
        observers: Observers,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            correlator,
            router,
            observers,
            instances: AtomicU64::new(0),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                instance: 0,
                shutdown: None,
                task: None,
            }),
            on_close: RwLock::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    /// Number of the current (or last) transport, starting at 1
    pub fn instance(&self) -> u64 {
        self.link.lock().instance
    }

    /// Invoked every time a transport closes, whatever the cause
    pub fn set_on_close(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_close.write() = Some(Arc::new(callback));
    }

    /// Open a transport; resolves once the WebSocket handshake completed
    ///
    /// The handshake is bounded by the configured connect timeout. Dropping
    /// the returned future before it resolves leaves the connection
    /// `Disconnected`.
    pub async fn connect(self: &Arc<Self>) -> Result<(), OcppError> {
        {
            let mut link = self.link.lock();
            match link.state {
                ConnectionState::Open => {
                    debug!("[{}] Already connected", self.identity());
                    return Ok(());
                }
                ConnectionState::Connecting => {
                    return Err(OcppError::ConnectFailed(
                        "connect already in progress".to_string(),
                    ));
                }
                ConnectionState::Disconnected => link.state = ConnectionState::Connecting,
            }
        }

        let attempt = ConnectAttempt { link: &self.link };

        info!("[{}] Connecting to central system: {}", self.identity(), self.url());

        let opened = tokio::time::timeout(self.config.connect_timeout, self.open_transport())
            .await
            .unwrap_or_else(|_| {
                Err(OcppError::ConnectFailed(format!(
                    "handshake not completed within {:?}",
                    self.config.connect_timeout
                )))
            });

        let ws = match opened {
            Ok(ws) => ws,
            Err(e) => {
                drop(attempt);
                error!("[{}] Connection failed: {}", self.identity(), e);
                self.report(json!({"event": "connect-failed", "url": self.url(), "error": e.to_string()}));
                self.push_console(ConsoleEvent::WsError(e.to_string()));
                return Err(e);
            }
        };

        let instance = self.instances.fetch_add(1, Ordering::SeqCst) + 1;
        let (writer, outbound) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!("[{}] WebSocket connected to {} (#{})", self.identity(), self.url(), instance);
        self.report(json!({"event": "open", "url": self.url(), "instance": instance}));
        self.push_console(ConsoleEvent::WsStatus {
            id: instance,
            description: format!("open ({})", self.url()),
        });

        // Attach the writer before the task can observe a close, so a
        // transport that dies immediately still goes through on_close
        self.correlator.on_open(writer);

        attempt.complete();
        let mut link = self.link.lock();
        link.state = ConnectionState::Open;
        link.instance = instance;
        link.shutdown = Some(shutdown_tx);
        link.task = Some(tokio::spawn(self.clone().run(ws, outbound, shutdown_rx, instance)));
        Ok(())
    }

    /// Close the transport and wait until the close has been processed
    ///
    /// The in-flight call, if any, is re-queued rather than failed.
    pub async fn close(&self) {
        let (shutdown, task) = {
            let mut link = self.link.lock();
            (link.shutdown.take(), link.task.take())
        };

        if let Some(shutdown) = shutdown {
            debug!("[{}] Closing connection", self.identity());
            let _ = shutdown.send(());
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("[{}] Connection task failed: {}", self.identity(), e);
            }
        }
    }

    /// Close, wait for the close to settle, then connect again
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), OcppError> {
        self.close().await;
        self.connect().await
    }

    async fn open_transport(&self) -> Result<WsStream, OcppError> {
        let mut request = self
            .url()
            .into_client_request()
            .map_err(|e| OcppError::InvalidUrl(format!("{}: {}", self.url(), e)))?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let connector = if self.config.is_secure() {
            self.tls_connector()?
        } else {
            None
        };

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            max_frame_size: Some(self.config.max_frame_size),
            ..Default::default()
        };

        let (ws, response) = connect_async_tls_with_config(request, Some(ws_config), false, connector)
            .await
            .map_err(|e| OcppError::ConnectFailed(e.to_string()))?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "[{}] Central system did not accept {} subprotocol, got: {:?}",
                self.identity(),
                OCPP_SUBPROTOCOL,
                accepted
            );
        }

        Ok(ws)
    }

    /// Client identity for `wss://`; without keystore entry the default
    /// TLS configuration is used
    fn tls_connector(&self) -> Result<Option<Connector>, OcppError> {
        let Some(pair) = self.observers.keystore.lookup(self.identity()) else {
            debug!("[{}] No client certificate in keystore", self.identity());
            return Ok(None);
        };
        debug!(
            "[{}] Using client key {} and certificate {}",
            self.identity(),
            pair.key.display(),
            pair.cert.display()
        );

        let read = |path: &std::path::Path| {
            std::fs::read(path).map_err(|e| OcppError::Tls(format!("{}: {}", path.display(), e)))
        };
        let key = read(&pair.key)?;
        let cert = read(&pair.cert)?;

        let identity = native_tls::Identity::from_pkcs8(&cert, &key)
            .map_err(|e| OcppError::Tls(e.to_string()))?;
        let connector = native_tls::TlsConnector::builder()
            .identity(identity)
            .build()
            .map_err(|e| OcppError::Tls(e.to_string()))?;

        Ok(Some(Connector::NativeTls(connector)))
    }

    /// Reader/writer loop for one transport
    async fn run(
        self: Arc<Self>,
        ws: WsStream,
        mut outbound: mpsc::UnboundedReceiver<OcppMessage>,
        mut shutdown: oneshot::Receiver<()>,
        instance: u64,
    ) {
        let (mut ws_tx, mut ws_rx) = ws.split();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    if let Err(e) = ws_tx.send(Message::Close(None)).await {
                        debug!("[{}] Close frame not sent: {}", self.identity(), e);
                    }
                    break;
                }

                Some(message) = outbound.recv() => {
                    let text = match message.to_text() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("[{}] Failed to serialize message: {}", self.identity(), e);
                            continue;
                        }
                    };

                    debug!("[{}] Sending: {}", self.identity(), text);
                    self.push_console(ConsoleEvent::Log(message.to_value()));

                    if let Err(e) = ws_tx.send(Message::text(text)).await {
                        // The read side reports the end of the stream
                        warn!("[{}] Failed to send WebSocket message: {}", self.identity(), e);
                        self.push_console(ConsoleEvent::WsError(e.to_string()));
                    }
                }

                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if self.handle_text(text.as_str()).is_err() {
                                let _ = ws_tx.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("[{}] Ignoring binary frame ({} bytes)", self.identity(), data.len());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] WebSocket closed by central system: {:?}", self.identity(), frame);
                        }
                        Some(Ok(_)) => {
                            // Ping/pong is answered by tungstenite
                        }
                        Some(Err(e)) => {
                            warn!("[{}] WebSocket error: {}", self.identity(), e);
                            self.push_console(ConsoleEvent::WsError(e.to_string()));
                        }
                        None => {
                            info!("[{}] WebSocket stream ended", self.identity());
                            break;
                        }
                    }
                }
            }
        }

        self.finish(instance);
    }

    /// Decode one inbound text frame; `Err` means the transport must close
    fn handle_text(&self, text: &str) -> Result<(), OcppError> {
        debug!("[{}] Received: {}", self.identity(), text);
        let logged = serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.to_string()));
        self.push_console(ConsoleEvent::Log(logged));

        match OcppMessage::parse(text.as_bytes()) {
            Ok(OcppMessage::Call(call)) => {
                match self.router.upgrade() {
                    Some(router) => router.route(call),
                    None => warn!("[{}] No router for {} ({})", self.identity(), call.action, call.message_id),
                }
                Ok(())
            }
            Ok(OcppMessage::CallResult(result)) => {
                self.settle(&result.message_id, Ok(result.payload))
            }
            Ok(OcppMessage::CallError(error)) => {
                let message_id = error.message_id.clone();
                self.settle(&message_id, Err(error.into_error()))
            }
            Err(OcppError::UnknownAction {
                message_id: Some(message_id),
                action,
            }) => {
                warn!("[{}] Unknown action {} ({}), answering NotImplemented", self.identity(), action, message_id);
                let reply = CallError::new(
                    message_id,
                    ErrorCode::NotImplemented,
                    format!("Action {} is not implemented", action),
                );
                if let Err(e) = self.correlator.send_reply(OcppMessage::CallError(reply)) {
                    warn!("[{}] Could not answer unknown action: {}", self.identity(), e);
                }
                Ok(())
            }
            Err(e) => {
                warn!("[{}] Dropping undecodable frame: {}", self.identity(), e);
                self.push_console(ConsoleEvent::WsError(format!("undecodable frame: {}", e)));
                Ok(())
            }
        }
    }

    fn settle(&self, message_id: &str, outcome: Result<Value, OcppError>) -> Result<(), OcppError> {
        self.correlator.resolve(message_id, outcome).map_err(|e| {
            error!("[{}] Closing connection: {}", self.identity(), e);
            self.push_console(ConsoleEvent::WsError(e.to_string()));
            e
        })
    }

    fn finish(&self, instance: u64) {
        self.correlator.on_close();
        {
            let mut link = self.link.lock();
            link.state = ConnectionState::Disconnected;
            link.shutdown = None;
        }

        info!("[{}] Connection #{} closed", self.identity(), instance);
        self.report(json!({"event": "closed", "url": self.url(), "instance": instance}));
        self.push_console(ConsoleEvent::WsStatus {
            id: instance,
            description: "closed.".to_string(),
        });

        let callback = self.on_close.read().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn push_console(&self, event: ConsoleEvent) {
        self.observers.console.push(self.identity(), event);
    }

    fn report(&self, message: Value) {
        self.observers
            .telemetry
            .record(LOGGER, self.identity(), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{NullConsole, StaticKeyStore, TracingTelemetry};
    use std::time::Duration;

    struct NoRouter;

    impl CallRouter for NoRouter {
        fn route(self: Arc<Self>, _call: Call) {}
    }

    fn connection(url: &str) -> (Arc<Connection>, Arc<dyn CallRouter>) {
        let config = ChargePointConfig::new(url).with_response_timeout(Duration::from_millis(100));
        let correlator = Correlator::new(config.identity.clone(), config.response_timeout, Arc::new(TracingTelemetry));
        let router: Arc<dyn CallRouter> = Arc::new(NoRouter);
        let conn = Connection::new(
            config,
            correlator,
            Arc::downgrade(&router),
            Observers {
                console: Arc::new(NullConsole),
                telemetry: Arc::new(TracingTelemetry),
                keystore: Arc::new(StaticKeyStore::new()),
            },
        );
        (conn, router)
    }

    #[tokio::test]
    async fn test_connect_failure_leaves_disconnected() {
        // Port 9 (discard) on localhost is not expected to accept WebSockets
        let (conn, _router) = connection("ws://127.0.0.1:9/CP-1");
        let err = conn.connect().await.unwrap_err();

        assert!(matches!(err, OcppError::ConnectFailed(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.instance(), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let (conn, _router) = connection("not a url");
        assert!(matches!(conn.connect().await, Err(OcppError::InvalidUrl(_))));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_key_files_fail_tls_setup() {
        let (conn, _router) = connection("wss://127.0.0.1:9/CP-1");
        let keystore = StaticKeyStore::new();
        keystore.insert(
            "CP-1",
            crate::collab::KeyPair {
                key: "/nonexistent/cp1.key".into(),
                cert: "/nonexistent/cp1.pem".into(),
            },
        );
        let conn = Connection::new(
            conn.config.clone(),
            conn.correlator.clone(),
            conn.router.clone(),
            Observers {
                console: Arc::new(NullConsole),
                telemetry: Arc::new(TracingTelemetry),
                keystore: Arc::new(keystore),
            },
        );

        assert!(matches!(conn.connect().await, Err(OcppError::Tls(_))));
    }

    /// Accepts TCP connections and never answers the upgrade request
    async fn silent_listener() -> (String, JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (format!("ws://{}/CP-SILENT", addr), task)
    }

    #[tokio::test]
    async fn test_cancelled_connect_can_be_retried() {
        let (url, server) = silent_listener().await;
        let (conn, _router) = connection(&url);

        let cancelled = tokio::time::timeout(Duration::from_millis(200), conn.connect()).await;
        assert!(cancelled.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // A second attempt is a fresh handshake, not "already in progress"
        let retried = tokio::time::timeout(Duration::from_millis(200), conn.connect()).await;
        assert!(retried.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        server.abort();
    }

    #[tokio::test]
    async fn test_handshake_is_bounded_by_connect_timeout() {
        let (url, server) = silent_listener().await;
        let config = ChargePointConfig::new(&url).with_connect_timeout(Duration::from_millis(100));
        let correlator = Correlator::new(config.identity.clone(), config.response_timeout, Arc::new(TracingTelemetry));
        let router: Arc<dyn CallRouter> = Arc::new(NoRouter);
        let conn = Connection::new(
            config,
            correlator,
            Arc::downgrade(&router),
            Observers {
                console: Arc::new(NullConsole),
                telemetry: Arc::new(TracingTelemetry),
                keystore: Arc::new(StaticKeyStore::new()),
            },
        );

        let err = tokio::time::timeout(Duration::from_secs(5), conn.connect())
            .await
            .expect("connect timeout should fire first")
            .unwrap_err();
        assert!(matches!(err, OcppError::ConnectFailed(ref reason) if reason.contains("handshake")));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.instance(), 0);

        server.abort();
    }

    #[tokio::test]
    async fn test_close_without_transport_is_noop() {
        let (conn, _router) = connection("ws://127.0.0.1:9/CP-1");
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
