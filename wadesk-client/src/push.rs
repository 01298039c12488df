use std::{sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header::AUTHORIZATION},
    },
};
use tracing::{debug, error, info, warn};
use wadesk_core::{StatusPayload, decode_frame};

use crate::{api::Session, config::millis, sync::Command, timer::TaskHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    Reconnected { attempt: u32 },
    Disconnected(DisconnectReason),
    /// A (re)connect attempt failed; more attempts may follow.
    ConnectFailed(String),
    /// Every reconnect attempt was used up.
    ReconnectFailed,
    AuthRejected,
    Status(StatusPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ServerClosed,
    ConnectionLost,
}

impl DisconnectReason {
    pub fn describe(self) -> &'static str {
        match self {
            DisconnectReason::ServerClosed => "server closed the connection",
            DisconnectReason::ConnectionLost => "connection lost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), doubling up to `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.delay.saturating_mul(1_u32 << shift).min(self.max_delay)
    }
}

/// Where a push connection reports its events. Tagged with the channel id
/// so events from a torn-down connection can be told apart.
#[derive(Debug, Clone)]
pub struct PushSink {
    tx: mpsc::UnboundedSender<Command>,
    channel: u64,
}

impl PushSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>, channel: u64) -> Self {
        Self { tx, channel }
    }

    /// Returns `false` once the synchronizer is gone.
    pub fn emit(&self, event: PushEvent) -> bool {
        self.tx
            .send(Command::Push {
                channel: self.channel,
                event,
            })
            .is_ok()
    }
}

/// Opens the server push channel. Dropping the returned handle closes it.
pub trait PushConnector: Send + Sync {
    fn open(&self, sink: PushSink) -> TaskHandle;
}

#[derive(Debug, Clone)]
pub struct WsPushConnector {
    url: String,
    session: Arc<Session>,
    policy: ReconnectPolicy,
}

enum ConnectError {
    Unauthorized,
    Failed(String),
}

impl WsPushConnector {
    pub fn new(url: impl Into<String>, session: Arc<Session>, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            session,
            policy,
        }
    }

    async fn run(self, sink: PushSink) {
        let mut attempt: u32 = 0;
        loop {
            info!(url = %self.url, attempt, "push connecting");
            match self.connect().await {
                Ok(stream) => {
                    let event = if attempt == 0 {
                        PushEvent::Connected
                    } else {
                        PushEvent::Reconnected { attempt }
                    };
                    info!(url = %self.url, attempt, "push connected");
                    if !sink.emit(event) {
                        return;
                    }
                    attempt = 0;

                    let reason = read_frames(stream, &sink).await;
                    warn!(url = %self.url, reason = reason.describe(), "push disconnected");
                    if !sink.emit(PushEvent::Disconnected(reason)) {
                        return;
                    }
                    if reason == DisconnectReason::ServerClosed {
                        return;
                    }
                }
                Err(ConnectError::Unauthorized) => {
                    warn!(url = %self.url, "push handshake rejected the bearer token");
                    self.session.expire();
                    sink.emit(PushEvent::AuthRejected);
                    return;
                }
                Err(ConnectError::Failed(message)) => {
                    error!(url = %self.url, attempt, "push connect failed: {message}");
                    if !sink.emit(PushEvent::ConnectFailed(message)) {
                        return;
                    }
                }
            }

            attempt += 1;
            if attempt > self.policy.attempts {
                error!(url = %self.url, attempts = self.policy.attempts, "push reconnect exhausted");
                sink.emit(PushEvent::ReconnectFailed);
                return;
            }
            tokio::time::sleep(self.policy.delay_for(attempt)).await;
        }
    }

    async fn connect(&self) -> Result<WsStream, ConnectError> {
        let token = self
            .session
            .bearer()
            .map_err(|_| ConnectError::Unauthorized)?;
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| ConnectError::Failed(format!("invalid push url: {err}")))?;
        let header = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ConnectError::Failed(format!("invalid token: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        match timeout(self.policy.connect_timeout, connect_async(request)).await {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(tungstenite::Error::Http(response)))
                if response.status() == StatusCode::UNAUTHORIZED =>
            {
                Err(ConnectError::Unauthorized)
            }
            Ok(Err(err)) => Err(ConnectError::Failed(err.to_string())),
            Err(_) => Err(ConnectError::Failed(format!(
                "connect timed out after {:?}",
                self.policy.connect_timeout
            ))),
        }
    }
}

impl PushConnector for WsPushConnector {
    fn open(&self, sink: PushSink) -> TaskHandle {
        TaskHandle::spawn(self.clone().run(sink))
    }
}

async fn read_frames<S>(mut stream: S, sink: &PushSink) -> DisconnectReason
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(next) = stream.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("push read failed: {err}");
                return DisconnectReason::ConnectionLost;
            }
        };

        match message {
            Message::Text(text) => match decode_frame(text.as_str()) {
                Ok(Some(payload)) => {
                    if !sink.emit(PushEvent::Status(payload)) {
                        return DisconnectReason::ConnectionLost;
                    }
                }
                Ok(None) => debug!("ignoring push event"),
                Err(err) => warn!("decode push frame failed: {err}"),
            },
            Message::Close(_) => return DisconnectReason::ServerClosed,
            _ => {}
        }
    }
    DisconnectReason::ConnectionLost
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn policy_reads_millis() {
        let policy: ReconnectPolicy =
            serde_json::from_str(r#"{"attempts":2,"delay":500}"#).unwrap();
        assert_eq!(policy.attempts, 2);
        assert_eq!(policy.delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sink_reports_closed_synchronizer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = PushSink::new(tx, 1);
        assert!(sink.emit(PushEvent::Connected));
        drop(rx);
        assert!(!sink.emit(PushEvent::Connected));
    }
}
