//! Bilibili live adapter.
//!
//! One session per adapter: an HTTP bootstrap call resolves the danmaku
//! endpoint and token for a room, then a TLS WebSocket carries the
//! framed binary protocol. A read task unframes inbound packets and
//! emits normalized [`Danmaku`] values on a bounded channel; a
//! keepalive task heartbeats every 30 seconds. The adapter never
//! reconnects by itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{COOKIE, ORIGIN, REFERER, USER_AGENT};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::live::{ConnectOptions, Danmaku, LiveAdapter, SessionState};
use crate::packet::{self, Packet, OP_HEARTBEAT, OP_MESSAGE};
use crate::{Error, Result};

const DEFAULT_API_BASE: &str = "https://api.live.bilibili.com";
const ROOM_ORIGIN: &str = "https://live.bilibili.com";
const BROWSER_AGENT: &str = "Mozilla/5.0";
const CHANNEL_CAPACITY: usize = 1000;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Deserialize)]
struct DanmuInfoResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<DanmuInfoData>,
}

#[derive(Debug, Deserialize)]
struct DanmuInfoData {
    host: String,
    port: u16,
    token: String,
}

struct Session {
    state: SessionState,
    room_id: String,
    receiver: Option<mpsc::Receiver<Danmaku>>,
    stop: Option<broadcast::Sender<()>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            room_id: String::new(),
            receiver: None,
            stop: None,
        }
    }
}

/// [`LiveAdapter`] implementation for the Bilibili live platform.
pub struct BilibiliAdapter {
    http: reqwest::Client,
    api_base: String,
    heartbeat_interval: Duration,
    connected: AtomicBool,
    session: Mutex<Session>,
}

impl BilibiliAdapter {
    pub fn new() -> Self {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    /// Use a different bootstrap endpoint. The WebSocket scheme follows
    /// the bootstrap scheme (`https` endpoints dial `wss`, `http` dials
    /// plain `ws`).
    pub fn with_api_base(api_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            connected: AtomicBool::new(false),
            session: Mutex::new(Session::default()),
        }
    }

    /// Shorten the keepalive cadence; used by tests.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.session.lock().await.state
    }

    fn ws_scheme(&self) -> &'static str {
        if self.api_base.starts_with("http://") {
            "ws"
        } else {
            "wss"
        }
    }

    async fn fetch_room_endpoint(&self, room_id: &str, cookie: &str) -> Result<DanmuInfoData> {
        let url = format!(
            "{}/xlive/web-room/v1/index/getDanmuInfo?id={}&type=0",
            self.api_base, room_id
        );
        let resp = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, BROWSER_AGENT)
            .header(reqwest::header::COOKIE, cookie)
            .header(reqwest::header::REFERER, format!("{ROOM_ORIGIN}/{room_id}"))
            .send()
            .await?;
        let info: DanmuInfoResponse = resp.json().await?;
        if info.code != 0 {
            return Err(Error::Unavailable(format!(
                "room bootstrap refused: {}",
                info.message
            )));
        }
        info.data
            .ok_or_else(|| Error::Protocol("room bootstrap response missing data".into()))
    }

    fn auth_packet(room_id: &str, token: &str) -> Packet {
        // The platform tolerates roomid as a string even though its
        // documented schema says integer.
        let body = json!({
            "uid": 0,
            "roomid": room_id,
            "protover": 3,
            "platform": "web",
            "type": 2,
            "key": token,
        });
        Packet::new(packet::OP_AUTH, body.to_string().into_bytes())
    }
}

impl Default for BilibiliAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveAdapter for BilibiliAdapter {
    async fn connect(&self, opts: &ConnectOptions) -> Result<()> {
        let mut session = self.session.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Err(Error::Conflict("already connected".into()));
        }
        session.state = SessionState::Connecting;
        session.room_id = opts.room_id.clone();

        let endpoint = match self.fetch_room_endpoint(&opts.room_id, &opts.cookie).await {
            Ok(data) => data,
            Err(e) => {
                session.state = SessionState::Disconnected;
                return Err(e);
            }
        };

        let ws_url = format!(
            "{}://{}:{}/sub",
            self.ws_scheme(),
            endpoint.host,
            endpoint.port
        );
        let mut request = match ws_url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                session.state = SessionState::Disconnected;
                return Err(Error::BadRequest(format!("invalid endpoint {ws_url}: {e}")));
            }
        };
        let headers = request.headers_mut();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_AGENT));
        headers.insert(ORIGIN, HeaderValue::from_static(ROOM_ORIGIN));
        if let Ok(value) = HeaderValue::from_str(&opts.cookie) {
            headers.insert(COOKIE, value);
        }
        if let Ok(value) = HeaderValue::from_str(&format!("{ROOM_ORIGIN}/{}", opts.room_id)) {
            headers.insert(REFERER, value);
        }

        let (stream, _) = match connect_async(request).await {
            Ok(connected) => connected,
            Err(e) => {
                session.state = SessionState::Disconnected;
                return Err(Error::Unavailable(format!("websocket connect failed: {e}")));
            }
        };
        let (mut sink, source) = stream.split();

        let auth = packet::encode(&Self::auth_packet(&opts.room_id, &endpoint.token));
        if let Err(e) = sink.send(Message::Binary(auth)).await {
            session.state = SessionState::Disconnected;
            return Err(Error::Unavailable(format!("auth send failed: {e}")));
        }
        session.state = SessionState::Authenticated;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (stop, _) = broadcast::channel(1);
        let sink = Arc::new(Mutex::new(sink));

        tokio::spawn(read_loop(source, tx, stop.subscribe()));
        tokio::spawn(heartbeat_loop(
            sink.clone(),
            self.heartbeat_interval,
            stop.clone(),
        ));

        session.receiver = Some(rx);
        session.stop = Some(stop);
        session.state = SessionState::Streaming;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(room = %opts.room_id, "live session streaming");
        Ok(())
    }

    async fn subscribe_danmaku(&self) -> Result<mpsc::Receiver<Danmaku>> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("not connected".into()));
        }
        self.session
            .lock()
            .await
            .receiver
            .take()
            .ok_or_else(|| Error::Conflict("message stream already taken".into()))
    }

    async fn send_chat(&self, _msg: &str) -> Result<()> {
        // Posting chat needs the authenticated web API, which this
        // adapter does not carry credentials for.
        Err(Error::Unavailable(
            "sending chat requires an authenticated platform API".into(),
        ))
    }

    async fn health_check(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable("not connected".into()))
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(stop) = session.stop.take() {
            let _ = stop.send(());
            tracing::info!(room = %session.room_id, "live session closed");
        }
        session.receiver = None;
        session.state = SessionState::Closed;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn read_loop(
    mut source: WsSource,
    tx: mpsc::Sender<Danmaku>,
    mut stop: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            next = source.next() => match next {
                Some(Ok(Message::Binary(data))) => {
                    for packet in packet::decode_all(&data) {
                        if packet.op != OP_MESSAGE {
                            continue;
                        }
                        if let Some(danmaku) = parse_danmaku(&packet.body) {
                            if tx.try_send(danmaku).is_err() {
                                tracing::warn!("danmaku channel full, dropping message");
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "live socket read failed");
                    break;
                }
            },
        }
    }
    // Dropping `tx` closes the stream; subscribers observe EOF.
    tracing::debug!("live read loop finished");
}

async fn heartbeat_loop(
    sink: Arc<Mutex<WsSink>>,
    interval: Duration,
    stop: broadcast::Sender<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut stopped = stop.subscribe();
    // The first tick fires immediately; skip it so the auth packet
    // stays the first frame on the wire.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stopped.recv() => break,
            _ = ticker.tick() => {
                let beat = packet::encode(&Packet::new(OP_HEARTBEAT, Vec::new()));
                if sink.lock().await.send(Message::Binary(beat)).await.is_err() {
                    tracing::warn!("heartbeat write failed, ending session");
                    let _ = stop.send(());
                    break;
                }
            }
        }
    }
}

/// Extract a chat message from a `MESSAGE` packet body.
///
/// The body is JSON when it starts with `{`. Chat events carry
/// `cmd == "DANMU_MSG"` and a nested `info` array where `info[0][1]`
/// holds the display text and `info[1]` is `[uid, username, ...]`.
/// Every other event kind is ignored.
pub fn parse_danmaku(body: &[u8]) -> Option<Danmaku> {
    if body.first() != Some(&b'{') {
        return None;
    }
    let value: Value = serde_json::from_slice(body).ok()?;
    if value.get("cmd").and_then(Value::as_str) != Some("DANMU_MSG") {
        return None;
    }
    let info = value.get("info")?.as_array()?;
    if info.len() < 2 {
        return None;
    }
    let content = info[0].as_array()?.get(1)?.as_str()?.to_string();
    let user = info[1].as_array()?;
    if user.len() < 2 {
        return None;
    }
    let user_id = scalar_to_string(&user[0]);
    let username = user[1].as_str()?.to_string();
    Some(Danmaku {
        username,
        user_id,
        content,
        timestamp: Utc::now().timestamp(),
        is_vip: false,
        is_admin: false,
        gift_value: 0,
    })
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
