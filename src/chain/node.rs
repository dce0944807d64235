//! Seam between the chain client and a concrete node transport

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use schnorrkel::Keypair;

use super::types::{AccountBalance, BlockHeader, ChainInfo, TransferEvent};
use crate::error::ChainError;

pub type EventStream = BoxStream<'static, Result<TransferEvent, ChainError>>;
pub type BalanceStream = BoxStream<'static, Result<AccountBalance, ChainError>>;
pub type HeadStream = BoxStream<'static, Result<BlockHeader, ChainError>>;

/// Opens sessions to a node endpoint
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<Arc<dyn NodeSession>, ChainError>;
}

/// An open connection to a node.
///
/// Account ids are raw 32-byte public keys; address decoding happens in the
/// client.
#[async_trait]
pub trait NodeSession: Send + Sync {
    async fn chain_info(&self) -> Result<ChainInfo, ChainError>;

    async fn current_block(&self) -> Result<u64, ChainError>;

    async fn account_balance(&self, account: &[u8; 32]) -> Result<AccountBalance, ChainError>;

    /// Partial fee of a `transfer_keep_alive` from `from` to `to`
    async fn transfer_fee(
        &self,
        from: &[u8; 32],
        to: &[u8; 32],
        amount: u128,
    ) -> Result<u128, ChainError>;

    /// Sign, submit and watch a transfer. The first item of the stream is
    /// `Submitted`.
    async fn submit_transfer(
        &self,
        signer: &Keypair,
        to: &[u8; 32],
        amount: u128,
    ) -> Result<EventStream, ChainError>;

    async fn subscribe_balance(&self, account: &[u8; 32]) -> Result<BalanceStream, ChainError>;

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ChainError>;

    /// True once the transport is gone. A closed session never recovers.
    fn is_closed(&self) -> bool {
        false
    }

    async fn disconnect(&self);
}
