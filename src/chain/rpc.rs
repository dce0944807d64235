//! JSON-RPC 2.0 over a single WebSocket connection
//!
//! A writer task drains an outbound queue into the socket and a reader task
//! dispatches replies by request id. Subscription replies register their
//! notification channel from inside the reader, before any later frame is
//! read, so no notification can arrive ahead of its subscriber.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::{SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::ChainError;

type CallReply = oneshot::Sender<Result<Value, ChainError>>;
type SubscribeReply = oneshot::Sender<Result<(String, mpsc::UnboundedReceiver<Value>), ChainError>>;

enum Pending {
    Call(CallReply),
    Subscribe(SubscribeReply),
}

#[derive(Default)]
struct Registry {
    pending: HashMap<u64, Pending>,
    subscriptions: HashMap<String, mpsc::UnboundedSender<Value>>,
    closed: bool,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn send_frame(&self, id: u64, method: &str, params: Value) -> Result<(), ChainError> {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.outbound
            .send(Message::Text(frame.to_string()))
            .map_err(|_| ChainError::connection_failed("connection closed"))
    }

    fn dispatch(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Discarding malformed RPC frame: {}", e);
                return;
            }
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let pending = self.registry().pending.remove(&id);
            match pending {
                Some(Pending::Call(reply)) => {
                    let _ = reply.send(parse_reply(value));
                }
                Some(Pending::Subscribe(reply)) => {
                    let outcome = parse_reply(value).and_then(|result| {
                        let sub_id = subscription_id(&result)?;
                        let (tx, rx) = mpsc::unbounded_channel();
                        self.registry().subscriptions.insert(sub_id.clone(), tx);
                        Ok((sub_id, rx))
                    });
                    if let Err(Ok((sub_id, _))) = reply.send(outcome) {
                        self.registry().subscriptions.remove(&sub_id);
                    }
                }
                // replies to fire-and-forget unsubscribes
                None => {}
            }
            return;
        }

        let params = value.get("params");
        let sub_id = params
            .and_then(|p| p.get("subscription"))
            .and_then(|id| subscription_id(id).ok());
        if let (Some(sub_id), Some(result)) = (sub_id, params.and_then(|p| p.get("result"))) {
            let registry = self.registry();
            if let Some(tx) = registry.subscriptions.get(&sub_id) {
                let _ = tx.send(result.clone());
            }
        }
    }

    fn close(&self, reason: &str) {
        let mut registry = self.registry();
        if registry.closed {
            return;
        }
        registry.closed = true;
        for (_, pending) in registry.pending.drain() {
            let error = ChainError::connection_failed(reason);
            match pending {
                Pending::Call(reply) => {
                    let _ = reply.send(Err(error));
                }
                Pending::Subscribe(reply) => {
                    let _ = reply.send(Err(error));
                }
            }
        }
        // dropping the senders ends every subscription stream
        registry.subscriptions.clear();
    }
}

fn parse_reply(value: Value) -> Result<Value, ChainError> {
    if let Some(error) = value.get("error") {
        return Err(ChainError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(value.get("result").cloned().unwrap_or(Value::Null))
}

fn subscription_id(value: &Value) -> Result<String, ChainError> {
    match value {
        Value::String(id) => Ok(id.clone()),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(ChainError::invalid_response(format!(
            "unexpected subscription id: {}",
            other
        ))),
    }
}

pub struct RpcClient {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    pub async fn connect(url: &str) -> Result<Self, ChainError> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ChainError::connection_failed(e.to_string()))?;
        let (mut sink, mut source) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let shared = Arc::new(Shared {
            outbound,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    log::warn!("RPC write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_shared.dispatch(&text),
                    Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                        Ok(text) => reader_shared.dispatch(text),
                        Err(_) => log::warn!("Discarding non-UTF-8 binary RPC frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("RPC read failed: {}", e);
                        break;
                    }
                }
            }
            reader_shared.close("connection closed");
        });

        log::debug!("RPC socket open to {}", url);
        Ok(Self {
            shared,
            reader,
            writer,
        })
    }

    /// Call `method` and decode its result
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_id();
        {
            let mut registry = self.shared.registry();
            if registry.closed {
                return Err(ChainError::connection_failed("connection closed"));
            }
            registry.pending.insert(id, Pending::Call(tx));
        }
        if let Err(e) = self.shared.send_frame(id, method, params) {
            self.shared.registry().pending.remove(&id);
            return Err(e);
        }

        let result = rx
            .await
            .map_err(|_| ChainError::connection_failed("connection closed"))??;
        serde_json::from_value(result)
            .map_err(|e| ChainError::invalid_response(format!("{}: {}", method, e)))
    }

    /// Open a subscription. `unsubscribe_method` is called when the returned
    /// stream is dropped.
    pub async fn subscribe(
        &self,
        method: &str,
        params: Value,
        unsubscribe_method: &'static str,
    ) -> Result<Subscription, ChainError> {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_id();
        {
            let mut registry = self.shared.registry();
            if registry.closed {
                return Err(ChainError::connection_failed("connection closed"));
            }
            registry.pending.insert(id, Pending::Subscribe(tx));
        }
        if let Err(e) = self.shared.send_frame(id, method, params) {
            self.shared.registry().pending.remove(&id);
            return Err(e);
        }

        let (sub_id, notifications) = rx
            .await
            .map_err(|_| ChainError::connection_failed("connection closed"))??;
        log::debug!("Subscription {} opened via {}", sub_id, method);

        Ok(Subscription {
            id: sub_id,
            notifications,
            unsubscribe_method,
            shared: self.shared.clone(),
        })
    }

    /// True once the socket has gone away, for whatever reason
    pub fn is_closed(&self) -> bool {
        self.shared.registry().closed
    }

    pub fn close(&self) {
        let _ = self.shared.outbound.send(Message::Close(None));
        self.shared.close("client closed");
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shared.close("client dropped");
        self.reader.abort();
        self.writer.abort();
    }
}

/// Notification stream of one subscription
pub struct Subscription {
    id: String,
    notifications: mpsc::UnboundedReceiver<Value>,
    unsubscribe_method: &'static str,
    shared: Arc<Shared>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.notifications.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let removed = self.shared.registry().subscriptions.remove(&self.id).is_some();
        if removed {
            let id = self.shared.next_id();
            let _ = self
                .shared
                .send_frame(id, self.unsubscribe_method, json!([self.id]));
            log::debug!("Subscription {} closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            outbound,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        });
        (shared, rx)
    }

    #[tokio::test]
    async fn routes_replies_by_id() {
        let (shared, _rx) = shared();
        let (tx, reply) = oneshot::channel();
        shared.registry().pending.insert(3, Pending::Call(tx));

        shared.dispatch(r#"{"jsonrpc":"2.0","id":3,"result":"0x2a"}"#);
        assert_eq!(reply.await.unwrap().unwrap(), json!("0x2a"));
    }

    #[tokio::test]
    async fn maps_error_replies() {
        let (shared, _rx) = shared();
        let (tx, reply) = oneshot::channel();
        shared.registry().pending.insert(1, Pending::Call(tx));

        shared.dispatch(r#"{"jsonrpc":"2.0","id":1,"error":{"code":1010,"message":"Invalid Transaction"}}"#);
        assert_eq!(
            reply.await.unwrap().unwrap_err(),
            ChainError::Rpc {
                code: 1010,
                message: "Invalid Transaction".into()
            }
        );
    }

    #[tokio::test]
    async fn notifications_following_a_subscribe_reply_are_kept() {
        let (shared, _rx) = shared();
        let (tx, reply) = oneshot::channel();
        shared.registry().pending.insert(1, Pending::Subscribe(tx));

        shared.dispatch(r#"{"jsonrpc":"2.0","id":1,"result":"sub-1"}"#);
        shared.dispatch(r#"{"jsonrpc":"2.0","method":"author_extrinsicUpdate","params":{"subscription":"sub-1","result":"ready"}}"#);

        let (id, mut notifications) = reply.await.unwrap().unwrap();
        assert_eq!(id, "sub-1");
        assert_eq!(notifications.recv().await.unwrap(), json!("ready"));
    }

    #[tokio::test]
    async fn close_fails_pending_and_ends_subscriptions() {
        let (shared, _rx) = shared();
        let (tx, reply) = oneshot::channel();
        shared.registry().pending.insert(9, Pending::Call(tx));
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        shared.registry().subscriptions.insert("s".into(), sub_tx);

        assert!(!shared.registry().closed);
        shared.close("connection closed");
        assert!(shared.registry().closed);
        assert!(matches!(reply.await.unwrap(), Err(ChainError::ConnectionFailed(_))));
        assert!(sub_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_sends_unsubscribe() {
        let (shared, mut rx) = shared();
        let (tx, notifications) = mpsc::unbounded_channel();
        shared.registry().subscriptions.insert("sub-7".into(), tx);

        drop(Subscription {
            id: "sub-7".into(),
            notifications,
            unsubscribe_method: "chain_unsubscribeNewHeads",
            shared: shared.clone(),
        });

        let Some(Message::Text(frame)) = rx.recv().await else {
            panic!("expected an unsubscribe frame");
        };
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["method"], "chain_unsubscribeNewHeads");
        assert_eq!(frame["params"], json!(["sub-7"]));
        assert!(shared.registry().subscriptions.is_empty());
    }
}
