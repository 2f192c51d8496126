//! ERC-20 ledger adapter over Ethereum JSON-RPC
//!
//! Talks to a signer-enabled node (the node holds the custodial key and
//! manages its nonce):
//!   balanceOf  -> eth_call
//!   transfer   -> eth_sendTransaction from the custodial address
//!   status     -> eth_getTransactionReceipt (+ eth_blockNumber for depth)

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::{LedgerClient, LedgerView, TransferRef, TransferState, normalize_address};
use crate::error::{LedgerError, LedgerResult};

/// `balanceOf(address)`
const BALANCE_OF_SELECTOR: &str = "70a08231";
/// `transfer(address,uint256)`
const TRANSFER_SELECTOR: &str = "a9059cbb";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvmLedgerConfig {
    /// JSON-RPC endpoint of a node that can sign for the custodial address
    pub rpc_url: String,
    /// ERC-20 token contract address
    pub token_contract: String,
    /// Custodial wallet address (the `from` of every reward transfer)
    pub custodial_address: String,
    /// Per-request HTTP timeout
    pub timeout_secs: u64,
    /// Blocks a receipt must be buried under before it counts as confirmed
    pub confirmations: u64,
    /// Optional explicit gas limit for transfers
    pub gas_limit: Option<u64>,
}

impl Default for EvmLedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            token_contract: String::new(),
            custodial_address: String::new(),
            timeout_secs: 10,
            confirmations: 1,
            gas_limit: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

pub struct EvmLedger {
    config: EvmLedgerConfig,
    http_client: Client,
    request_id: AtomicU64,
}

impl EvmLedger {
    pub fn new(mut config: EvmLedgerConfig) -> Result<Self> {
        Url::parse(&config.rpc_url).context("Invalid ledger RPC URL")?;

        config.token_contract = normalize_address(&config.token_contract)
            .ok_or_else(|| anyhow::anyhow!("Invalid token contract address: {}", config.token_contract))?;
        config.custodial_address = normalize_address(&config.custodial_address).ok_or_else(|| {
            anyhow::anyhow!("Invalid custodial address: {}", config.custodial_address)
        })?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("ctk-rewards/0.1")
            .build()
            .context("Failed to create ledger HTTP client")?;

        info!(
            token = %config.token_contract,
            custodial = %config.custodial_address,
            confirmations = config.confirmations,
            "EVM ledger client created"
        );

        Ok(Self {
            config,
            http_client,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> LedgerResult<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        debug!(method = %method, id = request.id, "JSON-RPC request");

        let resp = self
            .http_client
            .post(&self.config.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(LedgerError::Rejected(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(LedgerError::Ambiguous(format!("HTTP {}", status)));
        }

        let body: RpcResponse = resp
            .json()
            .await
            .map_err(|e| LedgerError::Ambiguous(format!("unreadable response: {}", e)))?;

        if let Some(error) = body.error {
            warn!(method = %method, code = error.code, message = %error.message, "JSON-RPC error");
            return Err(LedgerError::Rejected(format!("{} (code {})", error.message, error.code)));
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn block_number(&self) -> LedgerResult<u64> {
        let value = self.call("eth_blockNumber", json!([])).await?;
        let number = parse_quantity(&value)?;
        u64::try_from(number).map_err(|_| LedgerError::Malformed("block number overflow".to_string()))
    }
}

fn classify_transport_error(err: reqwest::Error) -> LedgerError {
    if err.is_timeout() {
        LedgerError::Timeout
    } else if err.is_connect() || err.is_builder() {
        LedgerError::Unreachable(err.to_string())
    } else {
        LedgerError::Ambiguous(err.to_string())
    }
}

/// Left-pad an address into a 32-byte ABI word.
fn encode_address(address: &str) -> LedgerResult<String> {
    let normalized = normalize_address(address)
        .ok_or_else(|| LedgerError::Rejected(format!("invalid address {}", address)))?;
    Ok(format!("{:0>64}", normalized[2..].to_ascii_lowercase()))
}

fn encode_balance_of(owner: &str) -> LedgerResult<String> {
    Ok(format!("0x{}{}", BALANCE_OF_SELECTOR, encode_address(owner)?))
}

fn encode_transfer(to: &str, amount: u128) -> LedgerResult<String> {
    Ok(format!("0x{}{}{:064x}", TRANSFER_SELECTOR, encode_address(to)?, amount))
}

/// Parse a hex quantity or 32-byte word into a `u128`.
fn parse_quantity(value: &Value) -> LedgerResult<u128> {
    let text = value
        .as_str()
        .ok_or_else(|| LedgerError::Malformed(format!("expected hex string, got {}", value)))?;
    let digits = text
        .strip_prefix("0x")
        .ok_or_else(|| LedgerError::Malformed(format!("missing 0x prefix: {}", text)))?;
    let significant = digits.trim_start_matches('0');
    if significant.is_empty() {
        return Ok(0);
    }
    if significant.len() > 32 {
        return Err(LedgerError::Malformed(format!("quantity exceeds u128: {}", text)));
    }
    u128::from_str_radix(significant, 16)
        .map_err(|e| LedgerError::Malformed(format!("bad hex quantity {}: {}", text, e)))
}

/// Map a transaction receipt (or its absence) to a transfer state.
fn receipt_state(receipt: &Value, head: Option<u64>, confirmations: u64) -> LedgerResult<TransferState> {
    if receipt.is_null() {
        return Ok(TransferState::Submitted);
    }

    match receipt.get("status").and_then(Value::as_str) {
        Some("0x0") => return Ok(TransferState::Failed),
        Some("0x1") => {}
        other => {
            return Err(LedgerError::Malformed(format!("unexpected receipt status {:?}", other)));
        }
    }

    if confirmations <= 1 {
        return Ok(TransferState::Confirmed);
    }

    let mined_at = receipt
        .get("blockNumber")
        .ok_or_else(|| LedgerError::Malformed("receipt without blockNumber".to_string()))
        .and_then(parse_quantity)?;
    let head = head.ok_or_else(|| LedgerError::Malformed("missing chain head".to_string()))? as u128;

    if head + 1 >= mined_at + confirmations as u128 {
        Ok(TransferState::Confirmed)
    } else {
        Ok(TransferState::Submitted)
    }
}

#[async_trait]
impl LedgerView for EvmLedger {
    async fn get_balance(&self, address: &str) -> LedgerResult<u128> {
        let params = json!([
            { "to": self.config.token_contract, "data": encode_balance_of(address)? },
            "latest"
        ]);
        let value = self.call("eth_call", params).await?;
        parse_quantity(&value)
    }

    async fn get_transfer_status(&self, transfer_ref: &TransferRef) -> LedgerResult<TransferState> {
        let receipt = self
            .call("eth_getTransactionReceipt", json!([transfer_ref.as_str()]))
            .await?;

        let head = if !receipt.is_null() && self.config.confirmations > 1 {
            Some(self.block_number().await?)
        } else {
            None
        };

        receipt_state(&receipt, head, self.config.confirmations)
    }

    fn custodial_address(&self) -> &str {
        &self.config.custodial_address
    }
}

#[async_trait]
impl LedgerClient for EvmLedger {
    async fn submit_transfer(&self, to: &str, amount: u128) -> LedgerResult<TransferRef> {
        let mut tx = json!({
            "from": self.config.custodial_address,
            "to": self.config.token_contract,
            "data": encode_transfer(to, amount)?,
        });
        if let Some(gas) = self.config.gas_limit {
            tx["gas"] = Value::String(format!("0x{:x}", gas));
        }

        let value = self.call("eth_sendTransaction", json!([tx])).await?;
        let hash = value
            .as_str()
            .filter(|h| h.starts_with("0x") && h.len() == 66)
            .ok_or_else(|| LedgerError::Ambiguous(format!("unexpected transaction hash {}", value)))?;

        info!(tx_hash = %hash, to = %to, amount = %amount, "Transfer broadcast");
        Ok(TransferRef::new(hash))
    }
}
