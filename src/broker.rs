use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum BrokerError {
    #[error("no recipients")]
    NoRecipients,
    #[error("broker subscription is closed")]
    Closed,
    #[error("broker transport failed: {0}")]
    Transport(String),
}

/// One published item: the channel it went out on and its opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

pub type MessageHandler = Arc<dyn Fn(BrokerMessage) + Send + Sync>;

/// Publish/subscribe transport shared by every relay process.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Hands `payload` to every subscription matching `channel`, on any
    /// process. Not retried; success is not a delivery guarantee.
    async fn publish(&self, payload: Vec<u8>, channel: &str) -> Result<(), BrokerError>;
    /// Registers `handler` for a glob `pattern` such as `messages:*`.
    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, patterns: &[&str]) -> Result<(), BrokerError>;
    /// Stops the receive loop and drops every subscription of this adapter.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Redis-style glob: `*` matches any run of characters, `?` exactly one.
pub fn glob_match(pattern: &str, channel: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let channel: Vec<char> = channel.chars().collect();
    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < channel.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == channel[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&ch| ch == '*')
}

/// In-process stand-in for a shared pub/sub server. Every [`MemoryBroker`]
/// attached to the same transport behaves like a separate relay process.
pub struct MemoryTransport {
    sender: broadcast::Sender<BrokerMessage>,
    patterns: RwLock<HashMap<String, usize>>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(MemoryTransport {
            sender,
            patterns: RwLock::new(HashMap::new()),
        })
    }

    async fn recipients(&self, channel: &str) -> usize {
        let patterns = self.patterns.read().await;
        patterns
            .iter()
            .filter(|(pattern, _)| glob_match(pattern, channel))
            .map(|(_, count)| count)
            .sum()
    }

    async fn add_pattern(&self, pattern: &str) {
        let mut patterns = self.patterns.write().await;
        *patterns.entry(pattern.to_string()).or_insert(0) += 1;
    }

    async fn remove_pattern(&self, pattern: &str) {
        let mut patterns = self.patterns.write().await;
        if let Some(count) = patterns.get_mut(pattern) {
            *count -= 1;
            if *count == 0 {
                patterns.remove(pattern);
            }
        }
    }
}

pub(crate) type Handlers = Arc<RwLock<HashMap<String, MessageHandler>>>;

/// Hands `msg` to every handler whose pattern matches its channel, on a task
/// of its own so the receive loop moves straight on to the next item.
pub(crate) fn deliver(handlers: &Handlers, msg: BrokerMessage) {
    let handlers = Arc::clone(handlers);
    tokio::spawn(async move {
        let matched: Vec<MessageHandler> = {
            let handlers = handlers.read().await;
            handlers
                .iter()
                .filter(|(pattern, _)| glob_match(pattern, &msg.channel))
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };
        for handler in matched {
            handler(msg.clone());
        }
    });
}

/// [`MessageBroker`] adapter over a [`MemoryTransport`].
///
/// A single receive loop reads the transport and passes each inbound item to
/// [`deliver`].
pub struct MemoryBroker {
    node_id: Uuid,
    transport: Arc<MemoryTransport>,
    handlers: Handlers,
    cancel: CancellationToken,
}

impl MemoryBroker {
    pub fn connect(transport: Arc<MemoryTransport>) -> Self {
        let node_id = Uuid::new_v4();
        let handlers: Handlers = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(serve_messages(
            node_id,
            transport.sender.subscribe(),
            Arc::clone(&handlers),
            cancel.clone(),
        ));
        debug!("broker node {node_id} attached");

        MemoryBroker {
            node_id,
            transport,
            handlers,
            cancel,
        }
    }
}

async fn serve_messages(
    node_id: Uuid,
    mut receiver: broadcast::Receiver<BrokerMessage>,
    handlers: Handlers,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => break,
            received = receiver.recv() => received,
        };
        match received {
            Ok(msg) => deliver(&handlers, msg),
            Err(RecvError::Lagged(skipped)) => {
                warn!("broker node {node_id} fell behind, {skipped} messages dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("broker node {node_id} receive loop stopped");
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, payload: Vec<u8>, channel: &str) -> Result<(), BrokerError> {
        if self.transport.recipients(channel).await == 0 {
            return Err(BrokerError::NoRecipients);
        }
        self.transport
            .sender
            .send(BrokerMessage {
                channel: channel.to_string(),
                payload,
            })
            .map(|_| ())
            .map_err(|_| BrokerError::NoRecipients)
    }

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let previous = self
            .handlers
            .write()
            .await
            .insert(pattern.to_string(), handler);
        if previous.is_none() {
            self.transport.add_pattern(pattern).await;
        }
        debug!("broker node {} subscribed to '{pattern}'", self.node_id);
        Ok(())
    }

    async fn unsubscribe(&self, patterns: &[&str]) -> Result<(), BrokerError> {
        let mut handlers = self.handlers.write().await;
        for pattern in patterns {
            if handlers.remove(*pattern).is_some() {
                self.transport.remove_pattern(pattern).await;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        let drained: Vec<String> = self.handlers.write().await.drain().map(|(p, _)| p).collect();
        for pattern in drained {
            self.transport.remove_pattern(&pattern).await;
        }
        Ok(())
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
