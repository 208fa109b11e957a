//! A reconnecting WebSocket client for the signaling relay.
//!
//! [`SignalingClient::connect`] dials the relay, sends the `join` message and starts
//! a background task that owns the socket for the rest of the client's life:
//! reconnecting with backoff on transient failure, retrying immediately (and once)
//! after a successful credential refresh on `401`, and forwarding decoded messages
//! to whoever is holding the [`SignalingClient::messages`] receiver.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod backoff;

use backoff::Backoff;
use connlib_model::PeerId;
use futures::{SinkExt, StreamExt};
use logging::err_with_src;
use protocol::{Join, Message as WireMessage};
use secrecy::{ExposeSecret as _, SecretString};
use socket_factory::{NoopProtector, SocketProtector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async_tls};
use tokio_util::sync::CancellationToken;
use url::Url;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const INBOUND_BUFFER: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Everything the client needs to send as the first message after dialing.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub peer_id: PeerId,
    pub public_key: String,
    pub address: Option<String>,
    pub routes: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl From<JoinInfo> for Join {
    fn from(info: JoinInfo) -> Self {
        Join {
            peer_id: info.peer_id,
            public_key: info.public_key,
            address: info.address,
            routes: info.routes,
            metadata: info.metadata,
        }
    }
}

pub struct Config {
    pub url: Url,
    pub token: SecretString,
    pub join: JoinInfo,
    /// `SO_MARK` applied to the TCP socket on Linux, to exclude signaling traffic
    /// from the tunnel's own routing table.
    pub mark: Option<u32>,
    pub protector: Arc<dyn SocketProtector>,
    pub dial_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Config {
    pub fn new(url: Url, token: SecretString, join: JoinInfo) -> Self {
        Self {
            url,
            token,
            join,
            mark: None,
            protector: Arc::new(NoopProtector),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Invoked synchronously when a dial fails with HTTP 401. Returning `true` means
/// credentials were refreshed and the next attempt should skip the backoff delay.
pub type AuthFailureHook = Box<dyn FnMut() -> bool + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
    #[error("signaling relay rejected credentials")]
    Unauthorized,
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum ClientCommand {
    Send(WireMessage),
    ForceReconnect,
    Close,
}

enum DialOutcome {
    Ok(WsStream),
    Unauthorized,
    Err(ConnectError),
}

enum ConnectionExit {
    /// The agent cancelled the client or called `close()`.
    Stopped,
    /// The socket broke; the caller should reconnect.
    Lost,
}

/// A reconnecting, authenticated WebSocket client for the signaling relay.
pub struct SignalingClient {
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    inbound_rx: AsyncMutex<Option<mpsc::Receiver<WireMessage>>>,
    task: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SignalingClient {
    /// Dials the relay and sends `join`. Blocks until that first attempt succeeds or
    /// permanently fails; every subsequent reconnect happens in the background.
    pub async fn connect(
        config: Config,
        on_auth_failure: Option<AuthFailureHook>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, ConnectError> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let dial_timeout = config.dial_timeout;

        let task = tokio::spawn(run(
            config,
            on_auth_failure,
            cmd_rx,
            inbound_tx,
            cancel,
            ready_tx,
        ));

        match tokio::time::timeout(dial_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(ConnectError::Timeout(dial_timeout)),
            Err(_) => return Err(ConnectError::Timeout(dial_timeout)),
        }

        Ok(Arc::new(Self {
            cmd_tx,
            inbound_rx: AsyncMutex::new(Some(inbound_rx)),
            task: AsyncMutex::new(Some(task)),
        }))
    }

    /// Synchronous write; silently dropped if the client has already stopped.
    pub fn send(&self, message: WireMessage) {
        let _ = self.cmd_tx.send(ClientCommand::Send(message));
    }

    /// Takes ownership of the receive channel. Closed exactly once, when the client
    /// has permanently stopped. Panics if called more than once.
    pub async fn messages(&self) -> mpsc::Receiver<WireMessage> {
        self.inbound_rx
            .lock()
            .await
            .take()
            .expect("messages() must only be called once")
    }

    /// Closes the current connection, if any, and skips the backoff delay on the
    /// next attempt. A no-op if the client has already stopped.
    pub fn force_reconnect(&self) {
        let _ = self.cmd_tx.send(ClientCommand::ForceReconnect);
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ClientCommand::Close);

        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn run(
    config: Config,
    mut on_auth_failure: Option<AuthFailureHook>,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
    inbound_tx: mpsc::Sender<WireMessage>,
    cancel: CancellationToken,
    mut ready_tx: Option<oneshot::Sender<Result<(), ConnectError>>>,
) {
    let mut backoff = Backoff::new(config.initial_backoff, config.max_backoff);
    let mut skip_backoff = true;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match dial_and_join(&config).await {
            DialOutcome::Ok(ws) => {
                backoff.reset();
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }

                match run_connection(ws, &mut cmd_rx, &inbound_tx, &cancel).await {
                    ConnectionExit::Stopped => break,
                    ConnectionExit::Lost => {
                        tracing::info!("Signaling connection lost, reconnecting");
                    }
                }
            }
            DialOutcome::Unauthorized => {
                let refreshed = on_auth_failure.as_mut().is_some_and(|hook| hook());

                if refreshed {
                    backoff.reset();
                    skip_backoff = true;
                    continue;
                }

                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(ConnectError::Unauthorized));
                    break;
                }
            }
            DialOutcome::Err(e) => {
                tracing::warn!(error = %err_with_src(&e), "Failed to dial signaling relay");

                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }

        if skip_backoff {
            skip_backoff = false;
            continue;
        }

        let delay = backoff.next_delay();

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => break,
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCommand::ForceReconnect) => skip_backoff = true,
                Some(ClientCommand::Close) | None => break,
                Some(ClientCommand::Send(_)) => {
                    tracing::debug!("Dropping outbound message while disconnected");
                }
            },
        }
    }

    drop(inbound_tx);
}

async fn run_connection(
    mut ws: WsStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    inbound_tx: &mpsc::Sender<WireMessage>,
    cancel: &CancellationToken,
) -> ConnectionExit {
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match protocol::decode(&text) {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            return ConnectionExit::Stopped;
                        }
                    }
                    Err(e) => tracing::warn!(error = %err_with_src(&e), "Malformed signaling message"),
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %err_with_src(&e), "Signaling connection error");
                    return ConnectionExit::Lost;
                }
                None => return ConnectionExit::Lost,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(ClientCommand::Send(message)) => match protocol::encode(&message) {
                    Ok(text) => {
                        if ws.send(WsMessage::Text(text.into())).await.is_err() {
                            return ConnectionExit::Lost;
                        }
                    }
                    Err(e) => tracing::warn!(error = %err_with_src(&e), "Failed to encode outbound message"),
                },
                Some(ClientCommand::ForceReconnect) => {
                    let _ = ws.close(None).await;
                    return ConnectionExit::Lost;
                }
                Some(ClientCommand::Close) | None => {
                    let _ = ws.close(None).await;
                    return ConnectionExit::Stopped;
                }
            },
            () = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return ConnectionExit::Stopped;
            }
        }
    }
}

async fn dial_and_join(config: &Config) -> DialOutcome {
    let mut ws = match dial(config).await {
        Ok(ws) => ws,
        Err(outcome) => return outcome,
    };

    let join = protocol::Message::Join(config.join.clone().into());

    let text = match protocol::encode(&join) {
        Ok(text) => text,
        Err(e) => return DialOutcome::Err(ConnectError::Io(std::io::Error::other(e))),
    };

    if let Err(e) = ws
        .send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
        .await
    {
        return DialOutcome::Err(e.into());
    }

    DialOutcome::Ok(ws)
}

async fn dial(config: &Config) -> Result<WsStream, DialOutcome> {
    let host = config
        .url
        .host_str()
        .ok_or_else(|| {
            DialOutcome::Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "signaling URL has no host",
            )))
        })?
        .to_owned();
    let port = config.url.port_or_known_default().unwrap_or(443);

    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| DialOutcome::Err(e.into()))?
        .next()
        .ok_or_else(|| {
            DialOutcome::Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not resolve signaling relay host",
            )))
        })?;

    let local = if addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };

    let socket = socket_factory::tcp(local, config.mark, config.protector.as_ref())
        .map_err(|e| DialOutcome::Err(e.into()))?;
    let stream = socket
        .connect(addr)
        .await
        .map_err(|e| DialOutcome::Err(e.into()))?;

    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| DialOutcome::Err(e.into()))?;
    request.headers_mut().insert(
        http::header::AUTHORIZATION,
        http::HeaderValue::from_str(&format!("Bearer {}", config.token.expose_secret()))
            .expect("token must be a valid header value"),
    );

    match client_async_tls(request, stream).await {
        Ok((ws, _response)) => Ok(ws),
        Err(tokio_tungstenite::tungstenite::Error::Http(response))
            if response.status() == http::StatusCode::UNAUTHORIZED =>
        {
            Err(DialOutcome::Unauthorized)
        }
        Err(e) => Err(DialOutcome::Err(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_info_maps_to_wire_join() {
        let info = JoinInfo {
            peer_id: PeerId::new("alpha"),
            public_key: "key".to_owned(),
            address: Some("10.0.0.1/24".to_owned()),
            routes: vec!["10.0.0.0/24".to_owned()],
            metadata: HashMap::new(),
        };

        let join: Join = info.clone().into();

        assert_eq!(join.peer_id, info.peer_id);
        assert_eq!(join.public_key, info.public_key);
    }
}
