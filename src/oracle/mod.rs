use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::{Classify, ErrorKind};

pub mod balance;
pub mod price;

pub use balance::{BalanceCheck, RpcBalanceOracle};
pub use price::{HttpPriceOracle, StaticPrice};

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("endpoint returned an unusable response")]
    BadResponse,

    #[error("price is not a finite positive number")]
    BadPrice,

    #[error("operation timed out")]
    TimedOut,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Classify for OracleError {
    fn kind(&self) -> ErrorKind {
        match self {
            // Upstream hiccups: a later attempt may see a good response.
            OracleError::BadResponse | OracleError::BadPrice | OracleError::TimedOut => {
                ErrorKind::Transient
            }
            OracleError::Http(e) if e.is_builder() => ErrorKind::Fatal,
            OracleError::Http(_) => ErrorKind::Transient,
        }
    }
}

/// Spot SOL→USD price used for every C1 decision.
#[async_trait]
pub trait SolPriceSource: Send + Sync {
    async fn sol_price_usd(&self) -> Result<f64, OracleError>;
}

/// Verifies a wallet's token balance against a required amount, compared in
/// the token's native fixed-point units.
#[async_trait]
pub trait TokenBalanceSource: Send + Sync {
    async fn check_balance(
        &self,
        mint: &str,
        wallet: &str,
        required: Decimal,
    ) -> Result<BalanceCheck, OracleError>;
}
