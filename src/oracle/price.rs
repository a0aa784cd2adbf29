use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use super::{OracleError, SolPriceSource};

/// How long a fetched price may serve repeat lookups.
const PRICE_TTL: Duration = Duration::from_secs(10);
/// Hard cap: a price older than this must never back a live C1 decision.
const MAX_PRICE_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(rename = "solPrice")]
    sol_price: f64,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

/// Price oracle over the HTTP endpoint returning `{ "solPrice": <number> }`.
///
/// Fetches are cached for [`PRICE_TTL`]; a failed refresh may fall back to a
/// cached value younger than [`MAX_PRICE_AGE`], otherwise the error
/// propagates.
pub struct HttpPriceOracle {
    http: reqwest::Client,
    url: String,
    cache: Mutex<Option<CachedPrice>>,
}

impl HttpPriceOracle {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            url: url.into(),
            cache: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<f64, OracleError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<PriceResponse>()
            .await?;

        let price = response.sol_price;
        if !price.is_finite() || price <= 0.0 {
            return Err(OracleError::BadPrice);
        }

        Ok(price)
    }

    fn cached(&self, max_age: Duration) -> Option<f64> {
        let cached = *self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cached
            .filter(|c| c.fetched_at.elapsed() < max_age)
            .map(|c| c.price)
    }

    fn store(&self, price: f64) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedPrice {
            price,
            fetched_at: Instant::now(),
        });
    }
}

#[async_trait]
impl SolPriceSource for HttpPriceOracle {
    async fn sol_price_usd(&self) -> Result<f64, OracleError> {
        if let Some(price) = self.cached(PRICE_TTL) {
            return Ok(price);
        }

        match self.fetch().await {
            Ok(price) => {
                self.store(price);
                Ok(price)
            }
            Err(error) => {
                // A slightly stale price beats none, up to the hard cap.
                if let Some(price) = self.cached(MAX_PRICE_AGE) {
                    tracing::warn!(%error, "price refresh failed, serving cached price");
                    Ok(price)
                } else {
                    Err(error)
                }
            }
        }
    }
}

/// Fixed price source for tests and offline runs.
#[derive(Debug, Clone, Copy)]
pub struct StaticPrice(pub f64);

#[async_trait]
impl SolPriceSource for StaticPrice {
    async fn sol_price_usd(&self) -> Result<f64, OracleError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_one(listener: TcpListener, body: &str) {
        let (mut stream, _) = listener.accept().await.expect("accept");

        // Drain the request head before answering.
        let mut buf = [0u8; 2048];
        let mut seen = Vec::new();
        loop {
            let n = stream.read(&mut buf).await.expect("read request");
            seen.extend_from_slice(&buf[..n]);
            if n == 0 || seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream
            .write_all(response.as_bytes())
            .await
            .expect("write response");
        stream.flush().await.expect("flush");
    }

    #[tokio::test]
    async fn fetches_once_and_serves_the_cache_within_ttl() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        // Exactly one response is available; a second fetch would hang.
        let server = tokio::spawn(async move {
            serve_one(listener, r#"{"solPrice": 142.5}"#).await;
        });

        let oracle = HttpPriceOracle::new(format!("http://{addr}"), Duration::from_secs(2))
            .expect("oracle");

        assert_eq!(oracle.sol_price_usd().await.expect("first"), 142.5);
        assert_eq!(oracle.sol_price_usd().await.expect("cached"), 142.5);

        server.await.expect("server");
    }

    #[tokio::test]
    async fn rejects_a_non_positive_price() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            serve_one(listener, r#"{"solPrice": 0.0}"#).await;
        });

        let oracle = HttpPriceOracle::new(format!("http://{addr}"), Duration::from_secs(2))
            .expect("oracle");

        assert!(matches!(
            oracle.sol_price_usd().await,
            Err(OracleError::BadPrice)
        ));
        server.await.expect("server");
    }

    #[tokio::test]
    async fn static_price_is_constant() {
        let oracle = StaticPrice(100.0);
        assert_eq!(oracle.sol_price_usd().await.expect("price"), 100.0);
        assert_eq!(oracle.sol_price_usd().await.expect("price"), 100.0);
    }
}
