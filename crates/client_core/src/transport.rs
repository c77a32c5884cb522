//! Channel subscriptions on the client side.
//!
//! A [`TransportConnector`] turns a signed-in [`Session`] into a
//! [`ChannelTransport`]; every event for a subscribed channel is pushed into
//! the sink handed to `connect`.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use channel_transport::{ChannelHub, Subscription};
use futures::{SinkExt, StreamExt};
use shared::{
    error::{ApiError, ApiException},
    protocol::{ChannelEvent, ChannelName, ClientFrame, ServerFrame},
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

use crate::backend::{parse_server_url, Session};

pub type ChannelEventSink = mpsc::UnboundedSender<(ChannelName, ChannelEvent)>;

const ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn subscribe(&self, channel: ChannelName) -> Result<()>;
    async fn unsubscribe(&self, channel: ChannelName) -> Result<()>;
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        session: &Session,
        sink: ChannelEventSink,
    ) -> Result<Arc<dyn ChannelTransport>>;
}

pub struct WebSocketConnector {
    server_url: Url,
}

impl WebSocketConnector {
    pub fn new(server_url: &str) -> Result<Self> {
        Ok(Self {
            server_url: parse_server_url(server_url)?,
        })
    }

    fn ws_url(&self, session: &Session) -> Result<Url> {
        let mut url = self.server_url.join("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", self.server_url))?;
        url.query_pairs_mut().append_pair("token", &session.token);
        Ok(url)
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(
        &self,
        session: &Session,
        sink: ChannelEventSink,
    ) -> Result<Arc<dyn ChannelTransport>> {
        let url = self.ws_url(session)?;
        let transport = WebSocketTransport::connect(url.as_str(), sink).await?;
        Ok(Arc::new(transport))
    }
}

type AckSender = oneshot::Sender<Result<(), ApiError>>;

const CONNECTION_CLOSED: &str = "connection closed";

/// Requests waiting for their ack, in send order.
#[derive(Default)]
struct AckQueue {
    waiting: VecDeque<AckSender>,
    closed: bool,
}

/// Realtime socket speaking [`ClientFrame`]/[`ServerFrame`].
///
/// The server answers every subscribe/unsubscribe frame with exactly one
/// `subscribed`, `unsubscribed` or `error` frame, in order, so acks are
/// matched to requests first-in first-out.
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<(ClientFrame, AckSender)>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl WebSocketTransport {
    pub async fn connect(ws_url: &str, sink: ChannelEventSink) -> Result<Self> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {}", redact(ws_url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let acks: Arc<StdMutex<AckQueue>> = Arc::default();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<(ClientFrame, AckSender)>();

        let writer_acks = Arc::clone(&acks);
        let writer = tokio::spawn(async move {
            while let Some((frame, ack)) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        let _ = ack.send(Err(ApiError::internal(err.to_string())));
                        continue;
                    }
                };
                if !enqueue(&writer_acks, ack) {
                    continue;
                }
                if ws_writer.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            close_acks(&writer_acks);
        });

        let reader_acks = Arc::clone(&acks);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame = match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => frame,
                    Err(error) => {
                        warn!(%error, "ignoring undecodable server frame");
                        continue;
                    }
                };
                match frame {
                    ServerFrame::Event { channel, event } => {
                        if sink.send((channel, event)).is_err() {
                            break;
                        }
                    }
                    ServerFrame::Subscribed { .. } | ServerFrame::Unsubscribed { .. } => {
                        resolve_next(&reader_acks, Ok(()));
                    }
                    ServerFrame::Error(err) => {
                        if !resolve_next(&reader_acks, Err(err.clone())) {
                            warn!(code = ?err.code, message = %err.message, "unsolicited server error");
                        }
                    }
                }
            }
            debug!("realtime socket closed");
            close_acks(&reader_acks);
        });

        Ok(Self {
            outbound,
            writer,
            reader,
        })
    }

    async fn request(&self, frame: ClientFrame) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send((frame, ack_tx))
            .map_err(|_| anyhow!("realtime connection is closed"))?;
        let ack = tokio::time::timeout(ACK_TIMEOUT, ack_rx)
            .await
            .context("timed out waiting for subscription ack")?
            .map_err(|_| anyhow!("realtime connection is closed"))?;
        ack.map_err(|err| ApiException::from(err).into())
    }
}

/// Queues `ack` for the next server reply; fails it at once when the socket is gone.
fn enqueue(acks: &StdMutex<AckQueue>, ack: AckSender) -> bool {
    match acks.lock() {
        Ok(mut queue) if !queue.closed => {
            queue.waiting.push_back(ack);
            true
        }
        _ => {
            let _ = ack.send(Err(ApiError::internal(CONNECTION_CLOSED)));
            false
        }
    }
}

fn close_acks(acks: &StdMutex<AckQueue>) {
    if let Ok(mut queue) = acks.lock() {
        queue.closed = true;
        for ack in queue.waiting.drain(..) {
            let _ = ack.send(Err(ApiError::internal(CONNECTION_CLOSED)));
        }
    }
}

fn resolve_next(acks: &StdMutex<AckQueue>, result: Result<(), ApiError>) -> bool {
    let next = acks.lock().ok().and_then(|mut queue| queue.waiting.pop_front());
    match next {
        Some(ack) => {
            let _ = ack.send(result);
            true
        }
        None => false,
    }
}

fn redact(ws_url: &str) -> &str {
    ws_url.split('?').next().unwrap_or(ws_url)
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

#[async_trait]
impl ChannelTransport for WebSocketTransport {
    async fn subscribe(&self, channel: ChannelName) -> Result<()> {
        self.request(ClientFrame::Subscribe { channel })
            .await
            .with_context(|| format!("subscribe to {channel} failed"))
    }

    async fn unsubscribe(&self, channel: ChannelName) -> Result<()> {
        self.request(ClientFrame::Unsubscribe { channel })
            .await
            .with_context(|| format!("unsubscribe from {channel} failed"))
    }
}

/// Connects straight to an in-process [`ChannelHub`], with no authorization.
#[derive(Clone)]
pub struct HubConnector {
    hub: ChannelHub,
}

impl HubConnector {
    pub fn new(hub: ChannelHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl TransportConnector for HubConnector {
    async fn connect(
        &self,
        _session: &Session,
        sink: ChannelEventSink,
    ) -> Result<Arc<dyn ChannelTransport>> {
        Ok(Arc::new(HubTransport {
            hub: self.hub.clone(),
            sink,
            forwarders: Mutex::new(HashMap::new()),
        }))
    }
}

/// Resolved once the forwarder has detached from the hub.
type StopSignal = oneshot::Sender<oneshot::Sender<()>>;

pub struct HubTransport {
    hub: ChannelHub,
    sink: ChannelEventSink,
    forwarders: Mutex<HashMap<ChannelName, StopSignal>>,
}

#[async_trait]
impl ChannelTransport for HubTransport {
    async fn subscribe(&self, channel: ChannelName) -> Result<()> {
        let mut forwarders = self.forwarders.lock().await;
        if forwarders.contains_key(&channel) {
            return Ok(());
        }
        let subscription = self.hub.subscribe(channel).await;
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(forward(subscription, stop_rx, self.sink.clone()));
        forwarders.insert(channel, stop_tx);
        Ok(())
    }

    async fn unsubscribe(&self, channel: ChannelName) -> Result<()> {
        let stop = self.forwarders.lock().await.remove(&channel);
        if let Some(stop) = stop {
            let (done_tx, done_rx) = oneshot::channel();
            if stop.send(done_tx).is_ok() {
                let _ = done_rx.await;
            }
        }
        Ok(())
    }
}

async fn forward(
    mut subscription: Subscription,
    mut stop: oneshot::Receiver<oneshot::Sender<()>>,
    sink: ChannelEventSink,
) {
    let channel = subscription.channel();
    let done = loop {
        tokio::select! {
            stopped = &mut stop => break stopped.ok(),
            event = subscription.recv() => {
                let Some(event) = event else { break None };
                if sink.send((channel, event)).is_err() {
                    break None;
                }
            }
        }
    };
    subscription.unsubscribe().await;
    if let Some(done) = done {
        let _ = done.send(());
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
