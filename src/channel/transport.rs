//! Wire transport behind the realtime channel.
//!
//! The channel is written against the [`Transport`]/[`WireSocket`] seam so
//! the reconnection machinery can be exercised without a network. The real
//! implementation negotiates a connection token over HTTP and then opens a
//! websocket with the caller's cookie state.

use crate::error::{MonitorError, Result};
use crate::session::AuthContext;
use reqwest::header::{COOKIE, REFERER, SET_COOKIE, USER_AGENT};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tungstenite::client::IntoClientRequest;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

/// Browser-ish user agent; the backend rejects obviously non-browser
/// clients.
const USER_AGENT_VALUE: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Relative path of the subscription page (referer + header-token fallback).
const SUBSCRIPTION_PAGE: &str = "/Attendance";

/// Client protocol version spoken on the negotiate and connect endpoints.
const CLIENT_PROTOCOL: &str = "2.1";

/// Cookie names the backend has been observed to carry a token in.
const TOKEN_COOKIE_KEYS: [&str; 3] = [
    "connectionToken=",
    "SignalR.ConnectionToken=",
    "__SignalRToken=",
];

/// Opaque connection token minted by negotiation.
#[derive(Clone, PartialEq, Eq)]
pub struct SubscriptionToken(String);

impl SubscriptionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.0.chars().take(8).collect();
        write!(f, "SubscriptionToken({preview}...)")
    }
}

/// Event produced by one blocking read of the wire.
#[derive(Debug)]
pub enum WireEvent {
    /// A text frame. May or may not decode to a hub invocation.
    Text(String),
    /// Transport-level keep-alive. Refreshes the idle clock, nothing else.
    Ping,
    /// The peer closed the connection. `normal` is true for a clean
    /// close-handshake with a normal status code.
    Closed { normal: bool },
}

/// One open wire connection. Single-threaded use: the channel's receive
/// loop is the only caller.
pub trait WireSocket: Send {
    fn send(&mut self, frame: &str) -> Result<()>;

    /// Read the next event, waiting at most `timeout`. `Ok(None)` means the
    /// wait elapsed with nothing to read.
    fn recv(&mut self, timeout: Duration) -> Result<Option<WireEvent>>;

    /// Best-effort close. Idempotent.
    fn close(&mut self);
}

/// Negotiates tokens and opens wire connections.
pub trait Transport: Send + Sync {
    /// Mint a fresh connection token for the subscription.
    fn negotiate(&self, auth: &AuthContext) -> Result<SubscriptionToken>;

    /// Open the push connection. Blocks up to roughly `timeout`; never
    /// retries internally.
    fn open(
        &self,
        auth: &AuthContext,
        token: &SubscriptionToken,
        timeout: Duration,
    ) -> Result<Box<dyn WireSocket>>;
}

/// Real transport: HTTP negotiate + websocket connect.
pub struct SignalrTransport {
    hub: String,
    client: reqwest::blocking::Client,
    /// Sequences the `tid` query parameter across opens.
    open_count: AtomicU64,
}

impl SignalrTransport {
    pub fn new(hub: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MonitorError::Negotiation(e.to_string()))?;
        Ok(Self {
            hub: hub.into(),
            client,
            open_count: AtomicU64::new(0),
        })
    }

    fn connection_data(&self) -> String {
        format!(r#"[{{"name":"{}"}}]"#, self.hub.to_lowercase())
    }

    fn referer(&self, base: &Url) -> String {
        format!("{}{}", base.origin().ascii_serialization(), SUBSCRIPTION_PAGE)
    }

    /// Ask the negotiate endpoint for a token. The response carries either
    /// a `ConnectionToken` field or a `Url` with the token in its query.
    fn negotiate_endpoint(&self, base: &Url, auth: &AuthContext) -> Result<SubscriptionToken> {
        let mut url = base
            .join("/signalr/negotiate")
            .map_err(|e| MonitorError::Negotiation(e.to_string()))?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        url.query_pairs_mut()
            .append_pair("clientProtocol", CLIENT_PROTOCOL)
            .append_pair("connectionData", &self.connection_data())
            .append_pair("_", &now_ms.to_string());

        let response = self
            .client
            .get(url)
            .header(COOKIE, auth.cookie_header())
            .header(REFERER, self.referer(base))
            .header("X-Requested-With", "XMLHttpRequest")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .send()
            .map_err(|e| MonitorError::Negotiation(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MonitorError::Negotiation(format!(
                "negotiate returned HTTP {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .map_err(|e| MonitorError::Negotiation(e.to_string()))?;

        if let Some(token) = body.get("ConnectionToken").and_then(|t| t.as_str()) {
            return Ok(SubscriptionToken::new(token));
        }

        if let Some(url_field) = body.get("Url").and_then(|u| u.as_str()) {
            if let Some(token) = token_from_query(url_field) {
                return Ok(SubscriptionToken::new(token));
            }
        }

        Err(MonitorError::Negotiation(
            "negotiate response carried no token".to_string(),
        ))
    }

    /// Fallback: some deployments hand the token out as a cookie on the
    /// subscription page instead of answering negotiate.
    fn token_from_headers(&self, base: &Url, auth: &AuthContext) -> Result<SubscriptionToken> {
        let url = base
            .join(SUBSCRIPTION_PAGE)
            .map_err(|e| MonitorError::Negotiation(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .header(COOKIE, auth.cookie_header())
            .header(USER_AGENT, USER_AGENT_VALUE)
            .send()
            .map_err(|e| MonitorError::Negotiation(e.to_string()))?;

        for value in response.headers().get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for key in TOKEN_COOKIE_KEYS {
                if let Some(start) = raw.find(key) {
                    let rest = &raw[start + key.len()..];
                    let token = rest.split(';').next().unwrap_or(rest).trim();
                    if !token.is_empty() {
                        return Ok(SubscriptionToken::new(token));
                    }
                }
            }
        }

        Err(MonitorError::Negotiation(
            "no connection token available".to_string(),
        ))
    }

    fn websocket_url(&self, base: &Url, token: &SubscriptionToken) -> Result<Url> {
        let mut url = base
            .join("/signalr/connect")
            .map_err(|e| MonitorError::Transport(e.to_string()))?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| MonitorError::Transport("unsupported base url scheme".to_string()))?;

        let tid = self.open_count.fetch_add(1, Ordering::Relaxed) % 11;
        url.query_pairs_mut()
            .append_pair("transport", "webSockets")
            .append_pair("clientProtocol", CLIENT_PROTOCOL)
            .append_pair("connectionToken", token.as_str())
            .append_pair("connectionData", &format!(r#"[{{"name":"{}"}}]"#, self.hub))
            .append_pair("tid", &tid.to_string());
        Ok(url)
    }
}

impl Transport for SignalrTransport {
    fn negotiate(&self, auth: &AuthContext) -> Result<SubscriptionToken> {
        let base = Url::parse(&auth.base_url)
            .map_err(|e| MonitorError::Negotiation(format!("bad base url: {e}")))?;

        match self.negotiate_endpoint(&base, auth) {
            Ok(token) => Ok(token),
            Err(err) => {
                tracing::debug!(error = %err, "negotiate endpoint failed, trying header fallback");
                self.token_from_headers(&base, auth)
            }
        }
    }

    fn open(
        &self,
        auth: &AuthContext,
        token: &SubscriptionToken,
        timeout: Duration,
    ) -> Result<Box<dyn WireSocket>> {
        let base = Url::parse(&auth.base_url)
            .map_err(|e| MonitorError::Transport(format!("bad base url: {e}")))?;
        let url = self.websocket_url(&base, token)?;

        let host = url
            .host_str()
            .ok_or_else(|| MonitorError::Transport("websocket url has no host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| MonitorError::Transport("websocket url has no port".to_string()))?;

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| MonitorError::Transport(format!("resolve {host}: {e}")))?;

        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => tracing::debug!(%addr, error = %e, "tcp connect failed"),
            }
        }
        let stream = stream
            .ok_or_else(|| MonitorError::Transport(format!("could not reach {host}:{port}")))?;

        stream.set_nodelay(true)?;
        // Also bounds the handshake reads.
        stream.set_read_timeout(Some(timeout))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| MonitorError::Transport(e.to_string()))?;
        let headers = request.headers_mut();
        let origin = base.origin().ascii_serialization();
        headers.insert("Cookie", header_value(&auth.cookie_header())?);
        headers.insert("Origin", header_value(&origin)?);
        headers.insert("Referer", header_value(&self.referer(&base))?);
        headers.insert("User-Agent", header_value(USER_AGENT_VALUE)?);

        let (ws, _response) = tungstenite::client_tls(request, stream)
            .map_err(|e| MonitorError::Transport(e.to_string()))?;

        Ok(Box::new(WsSocket { ws }))
    }
}

fn header_value(value: &str) -> Result<tungstenite::http::HeaderValue> {
    tungstenite::http::HeaderValue::from_str(value)
        .map_err(|e| MonitorError::Transport(e.to_string()))
}

/// Extract a `connectionToken` query parameter from a URL-ish string.
fn token_from_query(url_field: &str) -> Option<String> {
    // The field may be relative; give the parser a base to work against.
    let parsed = Url::parse(url_field)
        .or_else(|_| Url::parse("http://placeholder.invalid").and_then(|b| b.join(url_field)))
        .ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "connectionToken")
        .map(|(_, v)| v.into_owned())
}

/// Blocking websocket wrapped for polled reads.
struct WsSocket {
    ws: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl WsSocket {
    fn tcp(&self) -> Option<&TcpStream> {
        match self.ws.get_ref() {
            MaybeTlsStream::Plain(s) => Some(s),
            MaybeTlsStream::Rustls(s) => Some(s.get_ref()),
            _ => None,
        }
    }
}

impl WireSocket for WsSocket {
    fn send(&mut self, frame: &str) -> Result<()> {
        self.ws
            .send(Message::Text(frame.to_string()))
            .map_err(|e| MonitorError::Transport(e.to_string()))
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<WireEvent>> {
        if let Some(tcp) = self.tcp() {
            // Bounded read so the receive loop can observe control flags.
            let _ = tcp.set_read_timeout(Some(timeout));
        }

        match self.ws.read() {
            Ok(Message::Text(text)) => Ok(Some(WireEvent::Text(text))),
            Ok(Message::Binary(bytes)) => Ok(Some(WireEvent::Text(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(Some(WireEvent::Ping)),
            Ok(Message::Close(frame)) => {
                let normal = frame.is_some_and(|f| f.code == CloseCode::Normal);
                Ok(Some(WireEvent::Closed { normal }))
            }
            Ok(Message::Frame(_)) => Ok(None),
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(tungstenite::Error::ConnectionClosed)
            | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(Some(WireEvent::Closed { normal: true }))
            }
            Err(e) => Err(MonitorError::Transport(e.to_string())),
        }
    }

    fn close(&mut self) {
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
    }
}
