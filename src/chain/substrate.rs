//! Substrate node over WebSocket JSON-RPC

use std::sync::Arc;

use async_trait::async_trait;
use codec::{Compact, Decode};
use futures::stream::{self, StreamExt};
use schnorrkel::Keypair;
use serde::Deserialize;
use serde_json::{json, Value};

use super::extrinsic::{self, RuntimeContext};
use super::node::{BalanceStream, EventStream, HeadStream, NodeConnector, NodeSession};
use super::rpc::{RpcClient, Subscription};
use super::types::{AccountBalance, BlockHeader, ChainInfo, TransferEvent};
use crate::config::CallIndex;
use crate::crypto::ss58;
use crate::error::ChainError;

#[derive(Decode)]
struct AccountInfo {
    _nonce: u32,
    _consumers: u32,
    _providers: u32,
    _sufficients: u32,
    data: AccountData,
}

#[derive(Decode)]
struct AccountData {
    free: u128,
    reserved: u128,
    frozen: u128,
    flags: u128,
}

impl From<AccountData> for AccountBalance {
    fn from(data: AccountData) -> Self {
        Self {
            free: data.free,
            reserved: data.reserved,
            frozen: data.frozen,
            flags: data.flags,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeVersion {
    spec_version: u32,
    transaction_version: u32,
}

#[derive(Deserialize)]
struct Header {
    number: String,
}

/// Opens [`SubstrateSession`]s
#[derive(Clone, Debug)]
pub struct SubstrateConnector {
    transfer_call: CallIndex,
    ss58_prefix: u16,
}

impl SubstrateConnector {
    pub fn new(transfer_call: CallIndex, ss58_prefix: u16) -> Self {
        Self {
            transfer_call,
            ss58_prefix,
        }
    }
}

#[async_trait]
impl NodeConnector for SubstrateConnector {
    async fn open(&self, endpoint: &str) -> Result<Arc<dyn NodeSession>, ChainError> {
        let rpc = Arc::new(RpcClient::connect(endpoint).await?);

        let genesis: String = rpc.request("chain_getBlockHash", json!([0])).await?;
        let version: RuntimeVersion = rpc.request("state_getRuntimeVersion", json!([])).await?;
        let runtime = RuntimeContext {
            genesis_hash: decode_hash(&genesis)?,
            spec_version: version.spec_version,
            transaction_version: version.transaction_version,
        };
        log::info!(
            "Node runtime spec {} tx {} genesis {}",
            runtime.spec_version,
            runtime.transaction_version,
            genesis
        );

        Ok(Arc::new(SubstrateSession {
            rpc,
            runtime,
            transfer_call: self.transfer_call,
            ss58_prefix: self.ss58_prefix,
        }))
    }
}

pub struct SubstrateSession {
    rpc: Arc<RpcClient>,
    runtime: RuntimeContext,
    transfer_call: CallIndex,
    ss58_prefix: u16,
}

impl SubstrateSession {
    async fn next_nonce(&self, account: &[u8; 32]) -> Result<u64, ChainError> {
        let address = ss58::encode(account, self.ss58_prefix);
        self.rpc.request("system_accountNextIndex", json!([address])).await
    }

    async fn block_number(rpc: &RpcClient, block_hash: &str) -> Result<u64, ChainError> {
        let header: Header = rpc.request("chain_getHeader", json!([block_hash])).await?;
        parse_hex_number(&header.number)
    }
}

#[async_trait]
impl NodeSession for SubstrateSession {
    async fn chain_info(&self) -> Result<ChainInfo, ChainError> {
        let name: String = self.rpc.request("system_chain", json!([])).await?;
        let properties: Value = self.rpc.request("system_properties", json!([])).await?;

        Ok(ChainInfo {
            name,
            token_symbol: first_of(&properties, "tokenSymbol")
                .and_then(Value::as_str)
                .unwrap_or("UNIT")
                .to_string(),
            token_decimals: first_of(&properties, "tokenDecimals")
                .and_then(Value::as_u64)
                .and_then(|d| u8::try_from(d).ok())
                .unwrap_or(12),
            ss58_format: properties
                .get("ss58Format")
                .and_then(Value::as_u64)
                .and_then(|f| u16::try_from(f).ok())
                .unwrap_or(ss58::GENERIC_PREFIX),
            genesis_hash: format!("0x{}", hex::encode(self.runtime.genesis_hash)),
            spec_version: self.runtime.spec_version,
            transaction_version: self.runtime.transaction_version,
        })
    }

    async fn current_block(&self) -> Result<u64, ChainError> {
        let header: Header = self.rpc.request("chain_getHeader", json!([])).await?;
        parse_hex_number(&header.number)
    }

    async fn account_balance(&self, account: &[u8; 32]) -> Result<AccountBalance, ChainError> {
        let key = format!("0x{}", hex::encode(extrinsic::system_account_key(account)));
        let raw: Option<String> = self.rpc.request("state_getStorage", json!([key])).await?;
        decode_account(raw.as_deref())
    }

    async fn transfer_fee(
        &self,
        from: &[u8; 32],
        to: &[u8; 32],
        amount: u128,
    ) -> Result<u128, ChainError> {
        let nonce = self.next_nonce(from).await?;
        let mut data = extrinsic::unsigned_fee_transfer(from, self.transfer_call, to, amount, nonce);
        let len = data.len() as u32;
        data.extend_from_slice(&len.to_le_bytes());

        let raw: String = self
            .rpc
            .request(
                "state_call",
                json!(["TransactionPaymentApi_query_info", format!("0x{}", hex::encode(&data))]),
            )
            .await?;
        decode_partial_fee(&decode_hex(&raw)?)
    }

    async fn submit_transfer(
        &self,
        signer: &Keypair,
        to: &[u8; 32],
        amount: u128,
    ) -> Result<EventStream, ChainError> {
        let from = signer.public.to_bytes();
        let nonce = self.next_nonce(&from).await?;
        let ext = extrinsic::signed_transfer(signer, self.transfer_call, to, amount, nonce, &self.runtime);
        let tx_hash = format!("0x{}", hex::encode(extrinsic::extrinsic_hash(&ext)));
        log::debug!("Submitting extrinsic {} (nonce {})", tx_hash, nonce);

        let subscription = self
            .rpc
            .subscribe(
                "author_submitAndWatchExtrinsic",
                json!([format!("0x{}", hex::encode(&ext))]),
                "author_unwatchExtrinsic",
            )
            .await?;

        let submitted = stream::once(async move { Ok::<_, ChainError>(TransferEvent::Submitted { tx_hash }) });
        let updates = watch_updates(subscription, self.rpc.clone());
        Ok(submitted.chain(updates).boxed())
    }

    async fn subscribe_balance(&self, account: &[u8; 32]) -> Result<BalanceStream, ChainError> {
        let key = format!("0x{}", hex::encode(extrinsic::system_account_key(account)));
        let subscription = self
            .rpc
            .subscribe(
                "state_subscribeStorage",
                json!([[key.clone()]]),
                "state_unsubscribeStorage",
            )
            .await?;

        Ok(subscription
            .filter_map(move |change| {
                let update = storage_change(&change, &key).map(|raw| decode_account(raw.as_deref()));
                async move { update }
            })
            .boxed())
    }

    async fn subscribe_new_heads(&self) -> Result<HeadStream, ChainError> {
        let subscription = self
            .rpc
            .subscribe("chain_subscribeNewHeads", json!([]), "chain_unsubscribeNewHeads")
            .await?;
        let rpc = self.rpc.clone();

        Ok(subscription
            .then(move |header| {
                let rpc = rpc.clone();
                async move {
                    let number = header
                        .get("number")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ChainError::invalid_response("header without number"))
                        .and_then(parse_hex_number)?;
                    let hash: String = rpc.request("chain_getBlockHash", json!([number])).await?;
                    Ok(BlockHeader { number, hash })
                }
            })
            .boxed())
    }

    fn is_closed(&self) -> bool {
        self.rpc.is_closed()
    }

    async fn disconnect(&self) {
        self.rpc.close();
    }
}

/// Map `author_extrinsicUpdate` notifications to transfer events, ending
/// after the first terminal one. A watch that closes or times out before
/// that ends with an error item, since the extrinsic may still be included.
fn watch_updates(subscription: Subscription, rpc: Arc<RpcClient>) -> EventStream {
    stream::unfold(Some((subscription, rpc)), |state| async move {
        let (mut subscription, rpc) = state?;
        loop {
            let Some(update) = subscription.next().await else {
                return Some((Err(ChainError::SubscriptionClosed), None));
            };

            match classify_update(&update) {
                WatchStatus::Pending => continue,
                WatchStatus::InBlock(block_hash) => {
                    return Some((Ok(TransferEvent::InBlock { block_hash }), Some((subscription, rpc))))
                }
                WatchStatus::Finalized(block_hash) => {
                    let block_number = match SubstrateSession::block_number(&rpc, &block_hash).await {
                        Ok(number) => Some(number),
                        Err(e) => {
                            log::warn!("Could not fetch number of block {}: {}", block_hash, e);
                            None
                        }
                    };
                    let event = TransferEvent::Finalized {
                        block_hash,
                        block_number,
                    };
                    return Some((Ok(event), None));
                }
                WatchStatus::Failed(reason) => {
                    return Some((Ok(TransferEvent::Failed { reason }), None));
                }
                WatchStatus::TimedOut(reason) => {
                    return Some((Err(ChainError::Timeout(reason)), None));
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug, PartialEq, Eq)]
enum WatchStatus {
    Pending,
    InBlock(String),
    Finalized(String),
    Failed(String),
    TimedOut(String),
}

fn classify_update(update: &Value) -> WatchStatus {
    match update {
        Value::String(status) => match status.as_str() {
            "future" | "ready" => WatchStatus::Pending,
            "dropped" => WatchStatus::Failed("transaction dropped from the pool".to_string()),
            "invalid" => WatchStatus::Failed("transaction is invalid".to_string()),
            other => {
                log::debug!("Unknown extrinsic status '{}'", other);
                WatchStatus::Pending
            }
        },
        Value::Object(map) => {
            let hash = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
            if let Some(block) = hash("inBlock") {
                WatchStatus::InBlock(block)
            } else if let Some(block) = hash("finalized") {
                WatchStatus::Finalized(block)
            } else if let Some(block) = hash("finalityTimeout") {
                WatchStatus::TimedOut(format!("finality timeout in block {}", block))
            } else if let Some(by) = hash("usurped") {
                WatchStatus::Failed(format!("usurped by {}", by))
            } else {
                // broadcast, retracted
                WatchStatus::Pending
            }
        }
        _ => WatchStatus::Pending,
    }
}

/// Value for `key` in a `state_storage` notification. `Some(None)` means
/// the entry was removed.
fn storage_change(change: &Value, key: &str) -> Option<Option<String>> {
    change
        .get("changes")?
        .as_array()?
        .iter()
        .filter_map(Value::as_array)
        .find(|pair| pair.first().and_then(Value::as_str) == Some(key))
        .map(|pair| pair.get(1).and_then(Value::as_str).map(str::to_string))
}

fn decode_account(raw: Option<&str>) -> Result<AccountBalance, ChainError> {
    let Some(raw) = raw else {
        return Ok(AccountBalance::default());
    };
    let bytes = decode_hex(raw)?;
    AccountInfo::decode(&mut bytes.as_slice())
        .map(|info| info.data.into())
        .map_err(|e| ChainError::invalid_response(format!("account info: {}", e)))
}

/// `partial_fee` of a SCALE `RuntimeDispatchInfo` with a two-dimensional weight
fn decode_partial_fee(bytes: &[u8]) -> Result<u128, ChainError> {
    fn decode(input: &mut &[u8]) -> Result<u128, codec::Error> {
        let _ref_time = Compact::<u64>::decode(&mut *input)?;
        let _proof_size = Compact::<u64>::decode(&mut *input)?;
        let _class = u8::decode(&mut *input)?;
        u128::decode(&mut *input)
    }
    let mut input = bytes;
    decode(&mut input).map_err(|e| ChainError::invalid_response(format!("payment info: {}", e)))
}

fn first_of<'a>(properties: &'a Value, key: &str) -> Option<&'a Value> {
    match properties.get(key)? {
        Value::Array(values) => values.first(),
        value => Some(value),
    }
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| ChainError::invalid_response(format!("bad hex: {}", e)))
}

fn decode_hash(raw: &str) -> Result<[u8; 32], ChainError> {
    let bytes = decode_hex(raw)?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ChainError::invalid_response(format!("expected 32-byte hash, got {}", raw)))
}

fn parse_hex_number(raw: &str) -> Result<u64, ChainError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| ChainError::invalid_response(format!("bad block number {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Encode;

    #[test]
    fn classifies_watch_updates() {
        assert_eq!(classify_update(&json!("ready")), WatchStatus::Pending);
        assert_eq!(classify_update(&json!({"broadcast": ["peer"]})), WatchStatus::Pending);
        assert_eq!(
            classify_update(&json!({"inBlock": "0xb1"})),
            WatchStatus::InBlock("0xb1".into())
        );
        assert_eq!(
            classify_update(&json!({"finalized": "0xb1"})),
            WatchStatus::Finalized("0xb1".into())
        );
        assert!(matches!(classify_update(&json!("invalid")), WatchStatus::Failed(_)));
        assert!(matches!(classify_update(&json!("dropped")), WatchStatus::Failed(_)));
        assert!(matches!(
            classify_update(&json!({"usurped": "0xdead"})),
            WatchStatus::Failed(_)
        ));
        assert_eq!(
            classify_update(&json!({"finalityTimeout": "0xb1"})),
            WatchStatus::TimedOut("finality timeout in block 0xb1".into())
        );
    }

    #[test]
    fn decodes_account_info() {
        let mut raw = Vec::new();
        (3u32, 1u32, 1u32, 0u32).encode_to(&mut raw);
        (500u128, 20u128, 5u128, 0u128).encode_to(&mut raw);
        let hex_raw = format!("0x{}", hex::encode(raw));

        let balance = decode_account(Some(&hex_raw)).unwrap();
        assert_eq!(balance.free, 500);
        assert_eq!(balance.reserved, 20);
        assert_eq!(balance.frozen, 5);

        assert_eq!(decode_account(None).unwrap(), AccountBalance::default());
        assert!(decode_account(Some("0x0102")).is_err());
    }

    #[test]
    fn decodes_payment_info() {
        let mut raw = Vec::new();
        Compact(125_000_000u64).encode_to(&mut raw);
        Compact(3_593u64).encode_to(&mut raw);
        0u8.encode_to(&mut raw);
        1_234_567u128.encode_to(&mut raw);
        assert_eq!(decode_partial_fee(&raw).unwrap(), 1_234_567);
        assert!(decode_partial_fee(&raw[..4]).is_err());
    }

    #[test]
    fn extracts_storage_changes() {
        let change = json!({"block": "0x1", "changes": [["0xaa", "0x00"], ["0xbb", null]]});
        assert_eq!(storage_change(&change, "0xaa"), Some(Some("0x00".to_string())));
        assert_eq!(storage_change(&change, "0xbb"), Some(None));
        assert_eq!(storage_change(&change, "0xcc"), None);
    }

    #[test]
    fn reads_scalar_or_array_properties() {
        let props = json!({"tokenSymbol": ["tGLIN"], "tokenDecimals": 18});
        assert_eq!(first_of(&props, "tokenSymbol"), Some(&json!("tGLIN")));
        assert_eq!(first_of(&props, "tokenDecimals"), Some(&json!(18)));
        assert_eq!(parse_hex_number("0x1f").unwrap(), 31);
    }
}
