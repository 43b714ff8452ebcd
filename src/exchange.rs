//! Authenticated REST client for the upstream exchange.
//!
//! Every request is signed with an RSA-PSS (SHA-256) signature over
//! `timestamp_ms + METHOD + path`, sent alongside the API key id:
//! - `X-API-KEY`: key id
//! - `X-TIMESTAMP`: unix epoch milliseconds
//! - `X-SIGNATURE`: base64 PSS signature
//!
//! The private key is a PKCS#8 PEM file referenced by config. Quote fetches
//! work unauthenticated when no key is configured; order placement and
//! balance queries require one.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use rsa::pkcs8::DecodePrivateKey;
use rsa::pss::SigningKey;
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::types::{Quote, Side};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exchange returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Signing key unavailable: {0}")]
    Key(String),

    #[error("No credentials configured for authenticated request")]
    NoCredentials,
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    bid: f64,
    ask: f64,
    last: f64,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    side: &'a str,
    quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<f64>,
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub avg_fill_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    available: f64,
}

// ============================================================================
// SIGNING
// ============================================================================

/// The exact byte string the exchange expects under the signature.
pub fn signing_payload(timestamp_ms: i64, method: &str, path: &str) -> String {
    format!("{}{}{}", timestamp_ms, method, path)
}

/// RSA-PSS request signer wrapping a PKCS#8 private key.
pub struct RequestSigner {
    key: SigningKey<Sha256>,
}

impl RequestSigner {
    /// Load a signer from a PKCS#8 PEM file.
    pub fn from_pem_file(path: &str) -> ExchangeResult<Self> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| ExchangeError::Key(format!("read {}: {}", path, e)))?;
        Self::from_pem(&pem)
    }

    /// Load a signer from PKCS#8 PEM text.
    pub fn from_pem(pem: &str) -> ExchangeResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| ExchangeError::Key(format!("parse PKCS#8 key: {}", e)))?;
        Ok(Self {
            key: SigningKey::<Sha256>::new(private_key),
        })
    }

    #[cfg(test)]
    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        Self {
            key: SigningKey::<Sha256>::new(private_key),
        }
    }

    /// Sign `timestamp_ms + METHOD + path`, returning base64.
    pub fn sign(&self, timestamp_ms: i64, method: &str, path: &str) -> String {
        let payload = signing_payload(timestamp_ms, method, path);
        let mut rng = rand::thread_rng();
        let signature = self.key.sign_with_rng(&mut rng, payload.as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Exchange REST client. Cheap to clone is not needed; wrap in Arc.
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    signer: Option<RequestSigner>,
}

impl ExchangeClient {
    pub fn new(base_url: &str, api_key: &str, signer: Option<RequestSigner>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            signer,
        }
    }

    /// Whether authenticated requests are possible.
    pub fn has_credentials(&self) -> bool {
        self.signer.is_some() && !self.api_key.is_empty()
    }

    fn auth_headers(&self, method: &str, path: &str) -> ExchangeResult<[(String, String); 3]> {
        let signer = self.signer.as_ref().ok_or(ExchangeError::NoCredentials)?;
        if self.api_key.is_empty() {
            return Err(ExchangeError::NoCredentials);
        }

        let timestamp_ms = Utc::now().timestamp_millis();
        let signature = signer.sign(timestamp_ms, method, path);

        Ok([
            ("X-API-KEY".to_string(), self.api_key.clone()),
            ("X-TIMESTAMP".to_string(), timestamp_ms.to_string()),
            ("X-SIGNATURE".to_string(), signature),
        ])
    }

    async fn check(resp: reqwest::Response) -> ExchangeResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ExchangeError::Api {
            status: status.as_u16(),
            body,
        })
    }

    /// Fetch the current quote for a symbol.
    pub async fn get_quote(&self, symbol: &str) -> ExchangeResult<Quote> {
        let path = format!("/v1/quotes/{}", symbol);
        let url = format!("{}{}", self.base_url, path);

        let resp = Self::check(self.http.get(&url).send().await?).await?;
        let quote: QuoteResponse = resp.json().await?;

        debug!("[EXCHANGE] quote {} bid={} ask={}", symbol, quote.bid, quote.ask);

        Ok(Quote {
            bid: quote.bid,
            ask: quote.ask,
            last: quote.last,
            fetched_at: Utc::now(),
        })
    }

    /// Place an order on the exchange (signed).
    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        limit_price: Option<f64>,
    ) -> ExchangeResult<OrderAck> {
        let path = "/v1/orders";
        let url = format!("{}{}", self.base_url, path);
        let headers = self.auth_headers("POST", path)?;

        let body = OrderRequest {
            symbol,
            side: side.as_str(),
            quantity,
            limit_price,
        };

        let mut req = self.http.post(&url).json(&body);
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let resp = Self::check(req.send().await?).await?;
        let ack: OrderAck = resp.json().await?;

        debug!("[EXCHANGE] order ack id={} status={}", ack.order_id, ack.status);
        Ok(ack)
    }

    /// Fetch the available account balance in USD (signed).
    pub async fn get_balance(&self) -> ExchangeResult<f64> {
        let path = "/v1/balance";
        let url = format!("{}{}", self.base_url, path);
        let headers = self.auth_headers("GET", path)?;

        let mut req = self.http.get(&url);
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let resp = Self::check(req.send().await?).await?;
        let balance: BalanceResponse = resp.json().await?;
        Ok(balance.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pss::VerifyingKey;
    use rsa::signature::{Keypair, Verifier};

    fn test_signer() -> (RequestSigner, VerifyingKey<Sha256>) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let verifying = SigningKey::<Sha256>::new(private_key.clone()).verifying_key();
        (RequestSigner::from_private_key(private_key), verifying)
    }

    #[test]
    fn test_signing_payload_layout() {
        assert_eq!(
            signing_payload(1756500000000, "POST", "/v1/orders"),
            "1756500000000POST/v1/orders"
        );
    }

    #[test]
    fn test_signature_verifies() {
        let (signer, verifying) = test_signer();

        let ts = 1756500000000;
        let sig_b64 = signer.sign(ts, "GET", "/v1/balance");
        let sig_bytes = BASE64.decode(sig_b64).unwrap();
        let signature = rsa::pss::Signature::try_from(sig_bytes.as_slice()).unwrap();

        let payload = signing_payload(ts, "GET", "/v1/balance");
        verifying.verify(payload.as_bytes(), &signature).unwrap();

        // A different path must not verify
        let other = signing_payload(ts, "GET", "/v1/orders");
        assert!(verifying.verify(other.as_bytes(), &signature).is_err());
    }

    #[test]
    fn test_client_without_credentials() {
        let client = ExchangeClient::new("https://example.com/", "", None);
        assert!(!client.has_credentials());
        assert!(matches!(
            client.auth_headers("GET", "/v1/balance"),
            Err(ExchangeError::NoCredentials)
        ));
    }
}
