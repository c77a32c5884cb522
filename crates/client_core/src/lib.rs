use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ClientId, ConversationId, UserId},
    protocol::{ChannelEvent, ChannelName, Message},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod error;
pub mod list;
pub mod transport;
pub mod view;

pub use backend::{ChatBackend, HttpBackend, Session};
pub use error::SendError;
pub use list::{ConversationEntry, ConversationList};
pub use transport::{
    ChannelEventSink, ChannelTransport, HubConnector, TransportConnector, WebSocketConnector,
};
pub use view::{ConversationView, PendingMessage, Reconciled, ViewEntry};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationsLoaded(Vec<ConversationEntry>),
    ConversationListChanged(Vec<ConversationEntry>),
    ConversationOpened {
        conversation_id: ConversationId,
        messages: Vec<ViewEntry>,
    },
    ConversationClosed(ConversationId),
    ProvisionalAdded(PendingMessage),
    MessageReconciled {
        conversation_id: ConversationId,
        outcome: Reconciled,
        message: Message,
    },
    SendFailed {
        conversation_id: ConversationId,
        client_id: ClientId,
        reason: String,
    },
    /// Realtime trouble with nothing to reconcile, such as a closed connection.
    Error(String),
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn login(&self, username: &str) -> Result<UserId>;
    async fn refresh_conversations(&self) -> Result<Vec<ConversationEntry>>;
    async fn open_conversation(&self, conversation_id: ConversationId) -> Result<Vec<ViewEntry>>;
    async fn close_conversation(&self) -> Result<()>;
    async fn send_message(&self, content: &str) -> Result<Message, SendError>;
    async fn conversations(&self) -> Vec<ConversationEntry>;
    async fn open_messages(&self) -> Option<(ConversationId, Vec<ViewEntry>)>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct RealtimeClient {
    backend: Arc<dyn ChatBackend>,
    connector: Arc<dyn TransportConnector>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Default)]
struct ClientState {
    session: Option<Session>,
    transport: Option<Arc<dyn ChannelTransport>>,
    router: Option<JoinHandle<()>>,
    conversations: ConversationList,
    open: Option<ConversationView>,
}

impl ClientState {
    fn reset(&mut self) {
        if let Some(router) = self.router.take() {
            router.abort();
        }
        *self = Self::default();
    }
}

impl RealtimeClient {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn TransportConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            backend,
            connector,
            inner: Mutex::new(ClientState::default()),
            events,
        })
    }

    /// HTTP for requests, WebSocket for channels, both against `server_url`.
    pub fn connect_http(server_url: &str) -> Result<Arc<Self>> {
        Ok(Self::new(
            Arc::new(HttpBackend::new(server_url)?),
            Arc::new(WebSocketConnector::new(server_url)?),
        ))
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.lock().await.session.clone()
    }

    async fn connected(&self) -> Result<(Session, Arc<dyn ChannelTransport>)> {
        let guard = self.inner.lock().await;
        let session = guard
            .session
            .clone()
            .ok_or_else(|| anyhow!("not logged in"))?;
        let transport = guard
            .transport
            .clone()
            .ok_or_else(|| anyhow!("not logged in: realtime transport missing"))?;
        Ok((session, transport))
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_router(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<(ChannelName, ChannelEvent)>,
    ) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((channel, event)) = events.recv().await {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.route_event(channel, event).await;
            }
            debug!("channel event router stopped");
            if let Some(client) = client.upgrade() {
                client.emit(ClientEvent::Error("realtime connection closed".to_string()));
            }
        })
    }

    async fn route_event(&self, channel: ChannelName, event: ChannelEvent) {
        match (channel, event) {
            (ChannelName::Conversation(channel_id), ChannelEvent::NewMessage(message)) => {
                let conversation_id = message.conversation_id;
                if channel_id != conversation_id {
                    warn!(%channel, conversation_id = conversation_id.0, "message on wrong channel");
                    self.emit(ClientEvent::Error(format!(
                        "message for conversation {conversation_id} arrived on {channel}"
                    )));
                    return;
                }
                let mut guard = self.inner.lock().await;
                let Some(view) = guard
                    .open
                    .as_mut()
                    .filter(|view| view.conversation_id() == conversation_id)
                else {
                    debug!(conversation_id = conversation_id.0, "dropping event for closed conversation");
                    return;
                };
                let outcome = view.apply_new_message(message.clone());
                drop(guard);
                if !matches!(outcome, Reconciled::Ignored | Reconciled::Duplicate) {
                    self.emit(ClientEvent::MessageReconciled {
                        conversation_id,
                        outcome,
                        message,
                    });
                }
            }
            (
                ChannelName::User(_),
                ChannelEvent::ConversationUpdate {
                    conversation_id,
                    last_message,
                },
            ) => {
                let mut guard = self.inner.lock().await;
                if guard.conversations.apply_update(conversation_id, last_message) {
                    let snapshot = guard.conversations.entries().to_vec();
                    drop(guard);
                    self.emit(ClientEvent::ConversationListChanged(snapshot));
                } else {
                    debug!(conversation_id = conversation_id.0, "update for unlisted conversation");
                }
            }
            (channel, event) => {
                warn!(%channel, event = event.name(), "unexpected event for channel");
                self.emit(ClientEvent::Error(format!(
                    "unexpected {} event on {channel}",
                    event.name()
                )));
            }
        }
    }

    async fn load_conversations(&self, session: &Session) -> Result<Vec<ConversationEntry>> {
        let summaries = self.backend.list_conversations(session).await?;
        let mut guard = self.inner.lock().await;
        guard.conversations.replace_all(summaries);
        Ok(guard.conversations.entries().to_vec())
    }

    /// Drops the open view if it is still `conversation_id`.
    async fn discard_view(&self, conversation_id: ConversationId) {
        let mut guard = self.inner.lock().await;
        if guard
            .open
            .as_ref()
            .is_some_and(|view| view.conversation_id() == conversation_id)
        {
            guard.open = None;
        }
    }

    async fn rollback_send(&self, conversation_id: ConversationId, client_id: &ClientId) {
        let mut guard = self.inner.lock().await;
        if let Some(view) = guard
            .open
            .as_mut()
            .filter(|view| view.conversation_id() == conversation_id)
        {
            view.rollback(client_id);
        }
        if guard.conversations.clear_optimistic(conversation_id, client_id) {
            let snapshot = guard.conversations.entries().to_vec();
            drop(guard);
            self.emit(ClientEvent::ConversationListChanged(snapshot));
        }
    }
}

#[async_trait]
impl ChatClient for Arc<RealtimeClient> {
    async fn login(&self, username: &str) -> Result<UserId> {
        let session = self.backend.login(username).await?;
        let user_id = session.user_id;

        let previous_transport = {
            let mut guard = self.inner.lock().await;
            let previous = guard.transport.take();
            guard.reset();
            previous
        };
        drop(previous_transport);

        let (sink, events) = mpsc::unbounded_channel();
        let transport = self.connector.connect(&session, sink).await?;
        let router = self.spawn_router(events);

        if let Err(err) = transport.subscribe(ChannelName::User(user_id)).await {
            router.abort();
            return Err(err);
        }

        {
            let mut guard = self.inner.lock().await;
            guard.session = Some(session.clone());
            guard.transport = Some(transport);
            guard.router = Some(router);
        }

        let entries = match self.load_conversations(&session).await {
            Ok(entries) => entries,
            Err(err) => {
                self.inner.lock().await.reset();
                return Err(err);
            }
        };
        info!(user_id = user_id.0, conversations = entries.len(), "signed in");
        self.emit(ClientEvent::ConversationsLoaded(entries));
        Ok(user_id)
    }

    async fn refresh_conversations(&self) -> Result<Vec<ConversationEntry>> {
        let (session, _) = self.connected().await?;
        let entries = self.load_conversations(&session).await?;
        self.emit(ClientEvent::ConversationsLoaded(entries.clone()));
        Ok(entries)
    }

    async fn open_conversation(&self, conversation_id: ConversationId) -> Result<Vec<ViewEntry>> {
        let (session, transport) = self.connected().await?;

        let previous = {
            let mut guard = self.inner.lock().await;
            guard
                .open
                .replace(ConversationView::new(conversation_id))
                .map(|view| view.conversation_id())
        };

        if let Some(previous) = previous {
            if let Err(error) = transport
                .unsubscribe(ChannelName::Conversation(previous))
                .await
            {
                warn!(conversation_id = previous.0, %error, "failed to leave conversation channel");
            }
            if previous != conversation_id {
                self.emit(ClientEvent::ConversationClosed(previous));
            }
        }

        if let Err(err) = transport
            .subscribe(ChannelName::Conversation(conversation_id))
            .await
        {
            self.discard_view(conversation_id).await;
            return Err(err);
        }

        let history = match self
            .backend
            .history(&session, conversation_id, None, None)
            .await
        {
            Ok(history) => history,
            Err(err) => {
                self.discard_view(conversation_id).await;
                let _ = transport
                    .unsubscribe(ChannelName::Conversation(conversation_id))
                    .await;
                return Err(err);
            }
        };

        let messages = {
            let mut guard = self.inner.lock().await;
            let Some(view) = guard
                .open
                .as_mut()
                .filter(|view| view.conversation_id() == conversation_id)
            else {
                return Err(anyhow!(
                    "conversation {} was closed while loading",
                    conversation_id.0
                ));
            };
            view.seed(history);
            view.messages().to_vec()
        };

        debug!(conversation_id = conversation_id.0, messages = messages.len(), "conversation opened");
        self.emit(ClientEvent::ConversationOpened {
            conversation_id,
            messages: messages.clone(),
        });
        Ok(messages)
    }

    async fn close_conversation(&self) -> Result<()> {
        let (_, transport) = self.connected().await?;
        let closed = self.inner.lock().await.open.take();
        if let Some(view) = closed {
            let conversation_id = view.conversation_id();
            transport
                .unsubscribe(ChannelName::Conversation(conversation_id))
                .await?;
            self.emit(ClientEvent::ConversationClosed(conversation_id));
        }
        Ok(())
    }

    async fn send_message(&self, content: &str) -> Result<Message, SendError> {
        if content.trim().is_empty() {
            return Err(SendError::EmptyContent);
        }

        let (session, conversation_id, client_id, request, pending) = {
            let mut guard = self.inner.lock().await;
            let session = guard.session.clone().ok_or(SendError::NotSignedIn)?;
            let view = guard.open.as_mut().ok_or(SendError::NoOpenConversation)?;
            let conversation_id = view.conversation_id();
            let (client_id, request) = view.begin_send(session.user_id, content);
            let pending = view
                .pending(&client_id)
                .cloned()
                .ok_or(SendError::NoOpenConversation)?;
            guard.conversations.set_optimistic_last(pending.clone());
            (session, conversation_id, client_id, request, pending)
        };
        self.emit(ClientEvent::ProvisionalAdded(pending));

        match self.backend.send(&session, &request).await {
            Ok(message) => {
                // the channel echo usually lands first; either order converges
                let outcome = {
                    let mut guard = self.inner.lock().await;
                    guard
                        .open
                        .as_mut()
                        .filter(|view| view.conversation_id() == conversation_id)
                        .map(|view| view.apply_new_message(message.clone()))
                };
                if let Some(outcome @ (Reconciled::Replaced { .. } | Reconciled::Collapsed { .. })) =
                    outcome
                {
                    self.emit(ClientEvent::MessageReconciled {
                        conversation_id,
                        outcome,
                        message: message.clone(),
                    });
                }
                Ok(message)
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    client_id = %client_id,
                    error = %err,
                    "send failed; rolling back"
                );
                self.rollback_send(conversation_id, &client_id).await;
                self.emit(ClientEvent::SendFailed {
                    conversation_id,
                    client_id,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn conversations(&self) -> Vec<ConversationEntry> {
        self.inner.lock().await.conversations.entries().to_vec()
    }

    async fn open_messages(&self) -> Option<(ConversationId, Vec<ViewEntry>)> {
        let guard = self.inner.lock().await;
        guard
            .open
            .as_ref()
            .map(|view| (view.conversation_id(), view.messages().to_vec()))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
