/// Balance auto-refresh
///
/// Polls the free balance of the unlocked wallet at a fixed interval and
/// publishes it on a watch channel. Runs only while a wallet is unlocked:
/// the manager starts it on unlock and drops it on lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chain::{AccountBalance, ChainClient};
use crate::crypto::ss58;

pub type BalanceSender = Arc<watch::Sender<Option<AccountBalance>>>;

pub struct BalancePoller {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BalancePoller {
    /// Spawn the polling task. The first poll happens immediately.
    pub fn start(
        chain: Arc<ChainClient>,
        address: String,
        interval: Duration,
        publish: BalanceSender,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        log::info!(
            "Balance poller started for {} (every {}s)",
            ss58::short(&address),
            interval.as_secs()
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = chain.connect().await {
                            log::debug!("Balance poll skipped, node unavailable: {}", e);
                            continue;
                        }
                        match chain.get_balance(&address).await {
                            Ok(balance) => {
                                publish.send_replace(Some(balance));
                            }
                            Err(e) => log::debug!("Balance poll failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        log::info!("Balance poller shutting down");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop polling immediately, abandoning any in-flight request
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.handle.abort();
    }
}

impl Drop for BalancePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::node::{BalanceStream, EventStream, HeadStream, NodeConnector, NodeSession};
    use crate::chain::ChainInfo;
    use crate::error::ChainError;
    use async_trait::async_trait;
    use schnorrkel::Keypair;
    use std::sync::atomic::{AtomicU64, Ordering};

    const ALICE: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";

    struct CountingNode {
        polls: Arc<AtomicU64>,
    }

    #[async_trait]
    impl NodeSession for CountingNode {
        async fn chain_info(&self) -> Result<ChainInfo, ChainError> {
            Err(ChainError::NotConnected)
        }
        async fn current_block(&self) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn account_balance(&self, _: &[u8; 32]) -> Result<AccountBalance, ChainError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccountBalance {
                free: u128::from(n),
                ..Default::default()
            })
        }
        async fn transfer_fee(&self, _: &[u8; 32], _: &[u8; 32], _: u128) -> Result<u128, ChainError> {
            Ok(0)
        }
        async fn submit_transfer(&self, _: &Keypair, _: &[u8; 32], _: u128) -> Result<EventStream, ChainError> {
            Err(ChainError::NotConnected)
        }
        async fn subscribe_balance(&self, _: &[u8; 32]) -> Result<BalanceStream, ChainError> {
            Err(ChainError::NotConnected)
        }
        async fn subscribe_new_heads(&self) -> Result<HeadStream, ChainError> {
            Err(ChainError::NotConnected)
        }
        async fn disconnect(&self) {}
    }

    #[async_trait]
    impl NodeConnector for CountingNode {
        async fn open(&self, _: &str) -> Result<Arc<dyn NodeSession>, ChainError> {
            Ok(Arc::new(CountingNode {
                polls: self.polls.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_publishes_and_stops() {
        let polls = Arc::new(AtomicU64::new(0));
        let chain = Arc::new(ChainClient::new(
            "ws://test",
            Arc::new(CountingNode { polls: polls.clone() }),
        ));
        let (tx, mut rx) = watch::channel(None);
        let publish = Arc::new(tx);

        let poller = BalancePoller::start(chain, ALICE.to_string(), Duration::from_millis(20), publish);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_some());
        assert!(poller.is_running());

        poller.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(polls.load(Ordering::SeqCst), after_stop);
        assert!(!poller.is_running());
    }
}
