//! Shared test infrastructure for wallet integration tests
//!
//! `FakeNode` stands in for a Substrate node: balances and fees are set by
//! the test, submissions are recorded, and the status stream of every
//! transfer follows a script.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use glin_wallet_core::chain::{BalanceStream, EventStream, HeadStream, NodeConnector, NodeSession};
use glin_wallet_core::crypto::{ss58, KdfParams};
use glin_wallet_core::{AccountBalance, ChainError, ChainInfo, TransferEvent, WalletConfig, WalletManager};
use schnorrkel::Keypair;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

pub const PASSWORD: &str = "pw12345678";

pub fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// SS58 address of a fixed public key
pub fn address_of(byte: u8) -> String {
    ss58::encode(&[byte; 32], ss58::GENERIC_PREFIX)
}

/// How the status stream of the next transfers behaves after `Submitted`
#[derive(Clone, Debug)]
pub enum Script {
    Finalize,
    Fail(String),
    /// Reaches a block, then the stream ends without finality
    EndEarly,
}

pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub from: [u8; 32],
    pub to: [u8; 32],
    pub amount: u128,
}

struct NodeState {
    balances: HashMap<[u8; 32], u128>,
    fee: u128,
    script: Script,
    submissions: Vec<Submission>,
    gate: Option<Arc<Notify>>,
    reachable: bool,
    balance_gate: Option<Arc<Notify>>,
    balance_requests: usize,
}

#[derive(Clone)]
pub struct FakeNode {
    state: Arc<Mutex<NodeState>>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NodeState {
                balances: HashMap::new(),
                fee: 1_000,
                script: Script::Finalize,
                submissions: Vec::new(),
                gate: None,
                reachable: true,
                balance_gate: None,
                balance_requests: 0,
            })),
        }
    }

    pub fn set_balance(&self, address: &str, free: u128) {
        let id = ss58::decode_public_key(address).unwrap();
        self.state.lock().unwrap().balances.insert(id, free);
    }

    pub fn balance(&self, address: &str) -> u128 {
        let id = ss58::decode_public_key(address).unwrap();
        self.state.lock().unwrap().balances.get(&id).copied().unwrap_or(0)
    }

    pub fn set_fee(&self, fee: u128) {
        self.state.lock().unwrap().fee = fee;
    }

    pub fn set_script(&self, script: Script) {
        self.state.lock().unwrap().script = script;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unwrap().reachable = reachable;
    }

    /// Leave balance queries unanswered until [`FakeNode::release_balance`]
    pub fn hold_balance(&self) {
        self.state.lock().unwrap().balance_gate = Some(Arc::new(Notify::new()));
    }

    /// Answer every held balance query
    pub fn release_balance(&self) {
        if let Some(gate) = self.state.lock().unwrap().balance_gate.take() {
            gate.notify_waiters();
        }
    }

    pub fn balance_requests(&self) -> usize {
        self.state.lock().unwrap().balance_requests
    }

    /// Wait until the node saw `count` balance queries
    pub async fn wait_for_balance_requests(&self, count: usize) {
        for _ in 0..200 {
            if self.balance_requests() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} balance requests, got {}", count, self.balance_requests());
    }

    /// Hold every later status event until the returned gate is notified
    pub fn hold_after_submit(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().gate = Some(gate.clone());
        gate
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Wait until `count` transfers were submitted
    pub async fn wait_for_submissions(&self, count: usize) {
        for _ in 0..200 {
            if self.submissions().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} submissions, got {}", count, self.submissions().len());
    }
}

#[async_trait]
impl NodeConnector for FakeNode {
    async fn open(&self, _endpoint: &str) -> Result<Arc<dyn NodeSession>, ChainError> {
        if !self.state.lock().unwrap().reachable {
            return Err(ChainError::ConnectionFailed("connection refused".into()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl NodeSession for FakeNode {
    async fn chain_info(&self) -> Result<ChainInfo, ChainError> {
        Ok(ChainInfo {
            name: "GLIN Local".into(),
            token_symbol: "tGLIN".into(),
            token_decimals: 18,
            ss58_format: ss58::GENERIC_PREFIX,
            genesis_hash: format!("0x{}", "00".repeat(32)),
            spec_version: 100,
            transaction_version: 1,
        })
    }

    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(7)
    }

    async fn account_balance(&self, account: &[u8; 32]) -> Result<AccountBalance, ChainError> {
        let gate = {
            let mut state = self.state.lock().unwrap();
            state.balance_requests += 1;
            state.balance_gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let free = self.state.lock().unwrap().balances.get(account).copied().unwrap_or(0);
        Ok(AccountBalance {
            free,
            ..Default::default()
        })
    }

    async fn transfer_fee(&self, _: &[u8; 32], _: &[u8; 32], _: u128) -> Result<u128, ChainError> {
        Ok(self.state.lock().unwrap().fee)
    }

    async fn submit_transfer(
        &self,
        signer: &Keypair,
        to: &[u8; 32],
        amount: u128,
    ) -> Result<EventStream, ChainError> {
        let submission = Submission {
            from: signer.public.to_bytes(),
            to: *to,
            amount,
        };
        let (script, gate, tx_hash) = {
            let mut state = self.state.lock().unwrap();
            state.submissions.push(submission.clone());
            let tx_hash = format!("0x{:064x}", state.submissions.len());
            (state.script.clone(), state.gate.clone(), tx_hash)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let node = self.clone();
        tokio::spawn(async move {
            let _ = tx.send(TransferEvent::Submitted { tx_hash });
            if let Some(gate) = gate {
                gate.notified().await;
            }
            match script {
                Script::Finalize => {
                    let block_hash = format!("0x{}", "b1".repeat(32));
                    let _ = tx.send(TransferEvent::InBlock {
                        block_hash: block_hash.clone(),
                    });
                    node.apply(&submission);
                    let _ = tx.send(TransferEvent::Finalized {
                        block_hash,
                        block_number: Some(8),
                    });
                }
                Script::Fail(reason) => {
                    let _ = tx.send(TransferEvent::Failed { reason });
                }
                Script::EndEarly => {
                    let _ = tx.send(TransferEvent::InBlock {
                        block_hash: format!("0x{}", "b2".repeat(32)),
                    });
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        })
        .boxed())
    }

    async fn subscribe_balance(&self, account: &[u8; 32]) -> Result<BalanceStream, ChainError> {
        let current = self.account_balance(account).await?;
        Ok(futures::stream::iter(vec![Ok(current)])
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ChainError> {
        Ok(futures::stream::pending().boxed())
    }

    async fn disconnect(&self) {}
}

impl FakeNode {
    fn apply(&self, submission: &Submission) {
        let mut state = self.state.lock().unwrap();
        let fee = state.fee;
        let from = state.balances.entry(submission.from).or_insert(0);
        *from = from.saturating_sub(submission.amount + fee);
        *state.balances.entry(submission.to).or_insert(0) += submission.amount;
    }
}

/// Test environment with a temp data dir and a fake node
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub node: FakeNode,
    pub manager: Arc<WalletManager>,
}

impl TestEnvironment {
    pub async fn new() -> anyhow::Result<Self> {
        init_logger();
        let temp_dir = TempDir::new()?;
        log::info!("Test directory: {:?}", temp_dir.path());

        let node = FakeNode::new();
        let manager = Self::open_manager(&temp_dir, &node).await?;
        Ok(Self {
            temp_dir,
            node,
            manager,
        })
    }

    /// A second manager over the same data dir, as after a restart
    pub async fn reopen(&self) -> anyhow::Result<Arc<WalletManager>> {
        Self::open_manager(&self.temp_dir, &self.node).await
    }

    async fn open_manager(temp_dir: &TempDir, node: &FakeNode) -> anyhow::Result<Arc<WalletManager>> {
        let config = WalletConfig {
            data_dir: temp_dir.path().to_path_buf(),
            kdf: KdfParams::insecure_fast(),
            balance_poll_interval: Duration::from_millis(50),
            request_timeout: REQUEST_TIMEOUT,
            ..WalletConfig::default()
        };
        let manager = WalletManager::new_with_connector(config, Arc::new(node.clone()))?;
        manager.init().await?;
        Ok(Arc::new(manager))
    }
}
