//! Ethereum JSON-RPC provider over HTTP.

use super::{ChainProvider, ProviderError};
use crate::chain::{Amount, ReceiptLog, TransactionReceipt};
use crate::utils::constants::{ERC20_BALANCE_OF_SELECTOR, ERC20_DECIMALS_SELECTOR};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize, Debug)]
struct RpcResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value, ProviderError> {
        if let Some(error) = self.error {
            return Err(ProviderError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: String,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    data: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    #[serde(default)]
    status: Option<String>,
    gas_used: String,
    #[serde(default)]
    effective_gas_price: Option<String>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

pub struct JsonRpcProvider {
    url: String,
    http_client: Client,
    destroyed: AtomicBool,
    next_id: AtomicU64,
}

impl JsonRpcProvider {
    pub fn new(url: &str) -> Result<Self, ProviderError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self::with_client(http_client, url))
    }

    pub fn with_client(http_client: Client, url: &str) -> Self {
        Self {
            url: url.to_string(),
            http_client,
            destroyed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Tears the provider down. Every later call fails with `Destroyed`.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            log::info!("Provider: destroyed provider for {}", self.url);
        }
    }

    fn ensure_live(&self) -> Result<(), ProviderError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ProviderError::Destroyed);
        }
        Ok(())
    }

    fn request(&self, method: &str, params: Value) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
    }

    async fn post(&self, body: &Value) -> Result<Value, ProviderError> {
        self.ensure_live()?;
        let response = self
            .http_client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("HTTP error: {}", e)))?;
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Decode(format!("Failed to read response: {}", e)))?;
        // A teardown during the round trip still reports as destroyed
        self.ensure_live()?;
        Ok(value)
    }

    async fn rpc_send(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let body = self.request(method, params);
        let value = self.post(&body).await?;
        let response: RpcResponse =
            serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))?;
        response.into_result()
    }

    async fn eth_call(&self, to: &str, data: String) -> Result<String, ProviderError> {
        let result = self
            .rpc_send("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        value_as_str(&result, "eth_call").map(str::to_string)
    }
}

fn value_as_str<'a>(value: &'a Value, method: &str) -> Result<&'a str, ProviderError> {
    value
        .as_str()
        .ok_or_else(|| ProviderError::Decode(format!("{} returned a non-string result", method)))
}

fn parse_quantity(value: &str) -> Result<u64, ProviderError> {
    let digits = value.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(digits, 16)
        .map_err(|_| ProviderError::Decode(format!("invalid quantity {:?}", value)))
}

fn parse_amount(value: &str) -> Result<Amount, ProviderError> {
    Amount::from_hex(value).map_err(|e| ProviderError::Decode(e.to_string()))
}

/// `balanceOf(owner)` call data.
pub(crate) fn balance_of_call_data(owner: &str) -> String {
    let owner = owner.trim_start_matches("0x").to_lowercase();
    format!("0x{}{:0>64}", ERC20_BALANCE_OF_SELECTOR, owner)
}

fn parse_receipt(raw: RawReceipt) -> Result<Option<TransactionReceipt>, ProviderError> {
    // Nodes may return a receipt shell before the block is sealed
    let block_number = match raw.block_number {
        Some(block) => parse_quantity(&block)?,
        None => return Ok(None),
    };
    let status = match raw.status.as_deref() {
        Some(s) => parse_quantity(s)? == 1,
        None => true,
    };
    let effective_gas_price = match raw.effective_gas_price.as_deref() {
        Some(price) => parse_amount(price)?,
        None => Amount::zero(),
    };
    Ok(Some(TransactionReceipt {
        transaction_hash: raw.transaction_hash,
        block_number,
        status,
        gas_used: parse_amount(&raw.gas_used)?,
        effective_gas_price,
        logs: raw
            .logs
            .into_iter()
            .map(|log| ReceiptLog {
                address: log.address,
                topics: log.topics,
                data: log.data,
            })
            .collect(),
    }))
}

#[async_trait]
impl ChainProvider for JsonRpcProvider {
    async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, ProviderError> {
        let result = self
            .rpc_send("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let raw: RawReceipt =
            serde_json::from_value(result).map_err(|e| ProviderError::Decode(e.to_string()))?;
        parse_receipt(raw)
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<Option<u64>, ProviderError> {
        let result = self
            .rpc_send(
                "eth_getBlockByNumber",
                json!([format!("0x{:x}", block_number), false]),
            )
            .await?;
        match result.get("timestamp").and_then(Value::as_str) {
            Some(ts) => parse_quantity(ts).map(Some),
            None => Ok(None),
        }
    }

    async fn get_transaction_count(&self, address: &str) -> Result<u64, ProviderError> {
        let result = self
            .rpc_send("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_quantity(value_as_str(&result, "eth_getTransactionCount")?)
    }

    async fn get_balance(&self, address: &str) -> Result<Amount, ProviderError> {
        let result = self
            .rpc_send("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_amount(value_as_str(&result, "eth_getBalance")?)
    }

    async fn erc20_balance_of(&self, token: &str, owner: &str) -> Result<Amount, ProviderError> {
        let data = self.eth_call(token, balance_of_call_data(owner)).await?;
        parse_amount(&data)
    }

    async fn erc20_decimals(&self, token: &str) -> Result<u8, ProviderError> {
        let data = self
            .eth_call(token, format!("0x{}", ERC20_DECIMALS_SELECTOR))
            .await?;
        let decimals = parse_quantity(&data)?;
        u8::try_from(decimals)
            .map_err(|_| ProviderError::Decode(format!("decimals out of range: {}", decimals)))
    }

    async fn batch_balances(
        &self,
        owner: &str,
        tokens: &[String],
    ) -> Result<HashMap<String, Amount>, ProviderError> {
        if tokens.is_empty() {
            return Ok(HashMap::new());
        }

        let mut ids: HashMap<u64, &String> = HashMap::new();
        let mut batch = Vec::with_capacity(tokens.len());
        for token in tokens {
            let request = self.request(
                "eth_call",
                json!([{ "to": token, "data": balance_of_call_data(owner) }, "latest"]),
            );
            if let Some(id) = request.get("id").and_then(Value::as_u64) {
                ids.insert(id, token);
            }
            batch.push(request);
        }

        let value = self.post(&Value::Array(batch)).await?;
        let responses: Vec<RpcResponse> = match value {
            Value::Array(_) => {
                serde_json::from_value(value).map_err(|e| ProviderError::Decode(e.to_string()))?
            }
            // Some nodes reject a whole batch with a single error object
            other => {
                let single: RpcResponse = serde_json::from_value(other)
                    .map_err(|e| ProviderError::Decode(e.to_string()))?;
                single.into_result()?;
                return Err(ProviderError::Decode("batch response was not an array".to_string()));
            }
        };

        let mut balances = HashMap::new();
        for response in responses {
            let token = match response.id.as_u64().and_then(|id| ids.get(&id)) {
                Some(token) => (*token).clone(),
                None => continue,
            };
            match response.into_result() {
                Ok(Value::String(data)) => match parse_amount(&data) {
                    Ok(amount) => {
                        balances.insert(token, amount);
                    }
                    Err(e) => log::warn!("Provider: bad balance for {}: {}", token, e),
                },
                Ok(_) => log::warn!("Provider: empty balance result for {}", token),
                Err(e) => log::warn!("Provider: balance call failed for {}: {}", token, e),
            }
        }
        Ok(balances)
    }
}
