//! Chain access: connection state machine, queries, transfers and
//! subscriptions, with a WebSocket JSON-RPC node implementation.

pub mod client;
pub mod extrinsic;
pub mod node;
pub mod rpc;
pub mod substrate;
pub mod types;

pub use client::{ChainClient, SubscriptionHandle, TransferWatch};
pub use node::{BalanceStream, EventStream, HeadStream, NodeConnector, NodeSession};
pub use substrate::SubstrateConnector;
pub use types::{format_balance, AccountBalance, BlockHeader, ChainInfo, TransferEvent, TransferReceipt};
