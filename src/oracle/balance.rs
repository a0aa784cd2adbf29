use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;

use super::{OracleError, TokenBalanceSource};

/// Outcome of a balance verification. Amounts are in the token's native
/// fixed-point units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceCheck {
    pub has_enough: bool,
    pub actual_raw: u128,
    pub required_raw: u128,
    pub decimals: u32,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<ValueWrap<T>>,
    error: Option<RpcFault>,
}

#[derive(Debug, Deserialize)]
struct ValueWrap<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SupplyInfo {
    decimals: u32,
}

#[derive(Debug, Deserialize)]
struct TokenAccount {
    account: AccountInfo,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    data: AccountData,
}

#[derive(Debug, Deserialize)]
struct AccountData {
    parsed: ParsedData,
}

#[derive(Debug, Deserialize)]
struct ParsedData {
    info: TokenInfo,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(rename = "tokenAmount")]
    token_amount: TokenAmount,
}

#[derive(Debug, Deserialize)]
struct TokenAmount {
    amount: String,
}

/// Balance oracle over the token-account JSON-RPC interface: one call for
/// the mint's declared decimals, one for the wallet's account balance.
/// A missing token account is a zero balance, not an error.
pub struct RpcBalanceOracle {
    http: reqwest::Client,
    url: String,
}

impl RpcBalanceOracle {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, OracleError> {
        let envelope: RpcEnvelope<T> = self
            .http
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(fault) = envelope.error {
            tracing::warn!(code = fault.code, message = %fault.message, method, "rpc fault");
            return Err(OracleError::BadResponse);
        }

        envelope
            .result
            .map(|r| r.value)
            .ok_or(OracleError::BadResponse)
    }

    async fn mint_decimals(&self, mint: &str) -> Result<u32, OracleError> {
        let supply: SupplyInfo = self.call("getTokenSupply", json!([mint])).await?;

        Ok(supply.decimals)
    }

    async fn wallet_balance_raw(&self, mint: &str, wallet: &str) -> Result<u128, OracleError> {
        let accounts: Vec<TokenAccount> = self
            .call(
                "getTokenAccountsByOwner",
                json!([wallet, { "mint": mint }, { "encoding": "jsonParsed" }]),
            )
            .await?;

        let Some(account) = accounts.first() else {
            return Ok(0);
        };

        account
            .account
            .data
            .parsed
            .info
            .token_amount
            .amount
            .parse()
            .map_err(|_| OracleError::BadResponse)
    }
}

#[async_trait]
impl TokenBalanceSource for RpcBalanceOracle {
    async fn check_balance(
        &self,
        mint: &str,
        wallet: &str,
        required: Decimal,
    ) -> Result<BalanceCheck, OracleError> {
        let decimals = self.mint_decimals(mint).await?;
        let actual_raw = self.wallet_balance_raw(mint, wallet).await?;
        let required_raw = scale_to_raw(required, decimals);

        Ok(BalanceCheck {
            has_enough: actual_raw >= required_raw,
            actual_raw,
            required_raw,
            decimals,
        })
    }
}

/// Scales a human-readable amount into native fixed-point units. Excess
/// fractional digits round half-even; negative amounts scale to zero.
pub fn scale_to_raw(amount: Decimal, decimals: u32) -> u128 {
    let mut scaled = amount;
    scaled.rescale(decimals);

    scaled.mantissa().max(0) as u128
}
