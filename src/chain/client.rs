/// Chain client
///
/// Owns the connection to a node and exposes balance queries, fee
/// estimation, transfer submission and push subscriptions by SS58 address.
///
/// Connection lifecycle: `Disconnected -> Connecting -> Connected`.
/// Concurrent `connect()` calls share a single attempt; a failed attempt
/// returns the client to `Disconnected` and every waiter sees the same error.
/// A session that closes underneath the client, or a call that fails with
/// `ConnectionFailed`, also drops the client back to `Disconnected` so the
/// next `connect()` opens a fresh session. Every node request is bounded by
/// the request timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::watch;

use super::node::{EventStream, NodeConnector, NodeSession};
use super::types::{AccountBalance, BlockHeader, ChainInfo, TransferEvent, TransferReceipt};
use crate::crypto::{ss58, KeyPair};
use crate::error::ChainError;

type ConnectAttempt = Shared<BoxFuture<'static, Result<Arc<dyn NodeSession>, ChainError>>>;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

enum ConnectionState {
    Disconnected,
    Connecting { attempt: u64, future: ConnectAttempt },
    Connected(Arc<dyn NodeSession>),
}

pub struct ChainClient {
    endpoint: String,
    connector: Arc<dyn NodeConnector>,
    state: Mutex<ConnectionState>,
    attempts: AtomicU64,
    request_timeout: Duration,
}

fn same_session(a: &Arc<dyn NodeSession>, b: &Arc<dyn NodeSession>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

async fn bounded<T, F>(timeout: Duration, what: &str, call: F) -> Result<T, ChainError>
where
    F: Future<Output = Result<T, ChainError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Timeout(format!("{} after {:?}", what, timeout))),
    }
}

impl ChainClient {
    pub fn new(endpoint: impl Into<String>, connector: Arc<dyn NodeConnector>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
            attempts: AtomicU64::new(0),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Upper bound for connecting and for every single node request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connect to the node. Idempotent while connected.
    pub async fn connect(&self) -> Result<(), ChainError> {
        let (attempt, future) = {
            let mut state = self.state();
            match &*state {
                ConnectionState::Connected(session) if !session.is_closed() => return Ok(()),
                ConnectionState::Connecting { attempt, future } => (*attempt, future.clone()),
                _ => {
                    if matches!(&*state, ConnectionState::Connected(_)) {
                        log::warn!("Session to {} was closed, reconnecting", self.endpoint);
                    }
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let connector = self.connector.clone();
                    let endpoint = self.endpoint.clone();
                    let timeout = self.request_timeout;
                    log::info!("Connecting to {}", endpoint);
                    let future = async move {
                        let what = format!("connecting to {}", endpoint);
                        bounded(timeout, &what, connector.open(&endpoint)).await
                    }
                    .boxed()
                    .shared();
                    *state = ConnectionState::Connecting {
                        attempt,
                        future: future.clone(),
                    };
                    (attempt, future)
                }
            }
        };

        let result = future.await;

        let orphaned = {
            let mut state = self.state();
            let is_current = matches!(
                &*state,
                ConnectionState::Connecting { attempt: current, .. } if *current == attempt
            );
            if is_current {
                match &result {
                    Ok(session) => {
                        log::info!("Connected to {}", self.endpoint);
                        *state = ConnectionState::Connected(session.clone());
                    }
                    Err(e) => {
                        log::error!("Connection to {} failed: {}", self.endpoint, e);
                        *state = ConnectionState::Disconnected;
                    }
                }
                None
            } else {
                match (&*state, &result) {
                    // another waiter on this attempt already moved the state
                    (ConnectionState::Connected(current), Ok(session)) if same_session(current, session) => None,
                    (_, Ok(session)) => Some(session.clone()),
                    (_, Err(_)) => None,
                }
            }
        };

        if let Some(session) = orphaned {
            session.disconnect().await;
            return Err(ChainError::NotConnected);
        }
        result.map(|_| ())
    }

    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.state(), ConnectionState::Disconnected);
        if let ConnectionState::Connected(session) = previous {
            session.disconnect().await;
            log::info!("Disconnected from {}", self.endpoint);
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.state(), ConnectionState::Connected(session) if !session.is_closed())
    }

    fn session(&self) -> Result<Arc<dyn NodeSession>, ChainError> {
        let mut state = self.state();
        match &*state {
            ConnectionState::Connected(session) if !session.is_closed() => Ok(session.clone()),
            ConnectionState::Connected(_) => {
                log::warn!("Connection to {} was lost", self.endpoint);
                *state = ConnectionState::Disconnected;
                Err(ChainError::NotConnected)
            }
            _ => Err(ChainError::NotConnected),
        }
    }

    /// Run one request against `session`, dropping the session when the
    /// transport turns out to be gone
    async fn call<T, F>(&self, session: &Arc<dyn NodeSession>, what: &str, call: F) -> Result<T, ChainError>
    where
        F: Future<Output = Result<T, ChainError>>,
    {
        let result = bounded(self.request_timeout, what, call).await;
        if let Err(e) = &result {
            if matches!(e, ChainError::ConnectionFailed(_)) || session.is_closed() {
                self.forget(session, e);
            }
        }
        result
    }

    fn forget(&self, session: &Arc<dyn NodeSession>, error: &ChainError) {
        let mut state = self.state();
        let current = matches!(&*state, ConnectionState::Connected(c) if same_session(c, session));
        if current {
            log::warn!("Dropping session to {}: {}", self.endpoint, error);
            *state = ConnectionState::Disconnected;
        }
    }

    pub async fn chain_info(&self) -> Result<ChainInfo, ChainError> {
        let session = self.session()?;
        self.call(&session, "chain info", session.chain_info()).await
    }

    pub async fn current_block(&self) -> Result<u64, ChainError> {
        let session = self.session()?;
        self.call(&session, "current block", session.current_block()).await
    }

    pub async fn get_balance(&self, address: &str) -> Result<AccountBalance, ChainError> {
        let session = self.session()?;
        let account = account_id(address)?;
        self.call(&session, "balance query", session.account_balance(&account))
            .await
    }

    /// Fee the node would charge for this exact transfer
    pub async fn estimate_fee(&self, from: &str, to: &str, amount: u128) -> Result<u128, ChainError> {
        let session = self.session()?;
        let from = account_id(from)?;
        let to = account_id(to)?;
        self.call(&session, "fee estimate", session.transfer_fee(&from, &to, amount))
            .await
    }

    /// Sign and submit a transfer, returning its status stream
    pub async fn submit_transfer(
        &self,
        signer: &KeyPair,
        to: &str,
        amount: u128,
    ) -> Result<TransferWatch, ChainError> {
        let session = self.session()?;
        let dest = account_id(to)?;
        let keypair = signer
            .signing_keypair()
            .map_err(|_| ChainError::transfer_failed("signing account is locked"))?;

        log::info!(
            "Submitting transfer of {} from {} to {}",
            amount,
            ss58::short(signer.address()),
            ss58::short(to)
        );
        let events = self
            .call(&session, "transfer submission", session.submit_transfer(keypair, &dest, amount))
            .await?;
        Ok(TransferWatch::new(events))
    }

    /// Submit a transfer and wait for finalization. `on_status` sees every
    /// event, in order, before this returns.
    pub async fn transfer<F>(
        &self,
        signer: &KeyPair,
        to: &str,
        amount: u128,
        mut on_status: F,
    ) -> Result<TransferReceipt, ChainError>
    where
        F: FnMut(&TransferEvent),
    {
        let mut watch = self.submit_transfer(signer, to, amount).await?;
        watch.wait_finalized(&mut on_status).await
    }

    /// Push balance updates for `address` into `callback`
    pub async fn subscribe_balance<F>(
        &self,
        address: &str,
        callback: F,
    ) -> Result<SubscriptionHandle, ChainError>
    where
        F: Fn(AccountBalance) + Send + 'static,
    {
        let session = self.session()?;
        let account = account_id(address)?;
        let updates = self
            .call(&session, "balance subscription", session.subscribe_balance(&account))
            .await?;
        Ok(SubscriptionHandle::spawn(
            format!("balance {}", ss58::short(address)),
            updates,
            callback,
        ))
    }

    pub async fn subscribe_new_heads<F>(&self, callback: F) -> Result<SubscriptionHandle, ChainError>
    where
        F: Fn(BlockHeader) + Send + 'static,
    {
        let session = self.session()?;
        let heads = self
            .call(&session, "head subscription", session.subscribe_new_heads())
            .await?;
        Ok(SubscriptionHandle::spawn("new heads".to_string(), heads, callback))
    }
}

fn account_id(address: &str) -> Result<[u8; 32], ChainError> {
    ss58::decode_public_key(address).map_err(|e| ChainError::InvalidAddress(e.to_string()))
}

/// Status stream of one submitted transfer.
///
/// Yields events until the first terminal one, then ends.
pub struct TransferWatch {
    events: EventStream,
    tx_hash: Option<String>,
    done: bool,
}

impl TransferWatch {
    pub fn new(events: EventStream) -> Self {
        Self {
            events,
            tx_hash: None,
            done: false,
        }
    }

    /// Hash of the extrinsic, once `Submitted` has been observed
    pub fn tx_hash(&self) -> Option<&str> {
        self.tx_hash.as_deref()
    }

    /// Drain the stream until a terminal event.
    ///
    /// `TransferFailed` means the node rejected the extrinsic. Any other
    /// error, including [`ChainError::SubscriptionClosed`] when the stream
    /// ends early, leaves its fate unknown.
    pub async fn wait_finalized<F>(&mut self, on_status: &mut F) -> Result<TransferReceipt, ChainError>
    where
        F: FnMut(&TransferEvent),
    {
        while let Some(event) = self.next().await {
            let event = event?;
            on_status(&event);
            match event {
                TransferEvent::Finalized {
                    block_hash,
                    block_number,
                } => {
                    return Ok(TransferReceipt {
                        tx_hash: self.tx_hash.clone().unwrap_or_default(),
                        block_hash,
                        block_number,
                    })
                }
                TransferEvent::Failed { reason } => return Err(ChainError::TransferFailed(reason)),
                _ => {}
            }
        }
        Err(ChainError::SubscriptionClosed)
    }
}

impl Stream for TransferWatch {
    type Item = Result<TransferEvent, ChainError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.events.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(event))) => {
                if let TransferEvent::Submitted { tx_hash } = &event {
                    self.tx_hash = Some(tx_hash.clone());
                }
                if event.is_terminal() {
                    self.done = true;
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Live push subscription. Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    label: String,
    active: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl SubscriptionHandle {
    fn spawn<T, F>(
        label: String,
        mut updates: futures::stream::BoxStream<'static, Result<T, ChainError>>,
        callback: F,
    ) -> Self
    where
        T: Send + 'static,
        F: Fn(T) + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicBool::new(true));
        let task_active = active.clone();
        let task_label = label.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = updates.next() => match item {
                        Some(Ok(value)) => callback(value),
                        Some(Err(e)) => {
                            log::warn!("Subscription '{}' error: {}", task_label, e);
                            break;
                        }
                        None => {
                            log::debug!("Subscription '{}' closed by node", task_label);
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
            task_active.store(false, Ordering::SeqCst);
        });

        log::debug!("Subscribed to {}", label);
        Self {
            label,
            active,
            shutdown_tx,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop delivery. Safe to call any number of times.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
            log::debug!("Unsubscribed from {}", self.label);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
