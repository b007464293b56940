//! The payment provider, reached over HTTP.
//!
//! Only the three calls the campaign payment flow needs are modelled:
//! initializing a transaction, verifying it, and checking the signature of a
//! webhook delivery.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tracing::debug;

use crate::account::Amount;
use crate::config::GatewayConfig;
use crate::error::Error;

type HmacSha512 = Hmac<Sha512>;

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";
pub const CHARGE_SUCCESS: &str = "charge.success";

const REFERENCE_PREFIX: &str = "ADF";
const REFERENCE_LENGTH: usize = 16;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TransactionInit {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Success,
    Pending,
    Ongoing,
    Failed,
    Abandoned,
    Reversed,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TransactionVerification {
    pub reference: String,
    pub status: TransactionStatus,
    pub amount: Amount,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initialize_transaction(
        &self,
        amount: Amount,
        reference: &str,
        email: &str,
    ) -> Result<TransactionInit, Error>;

    async fn verify_transaction(&self, reference: &str) -> Result<TransactionVerification, Error>;

    /// Whether `signature` is the provider's signature of `payload`.
    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool;
}

/// A fresh, unguessable payment reference.
pub fn generate_reference() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(REFERENCE_LENGTH)
        .map(char::from)
        .collect();

    format!("{}-{}", REFERENCE_PREFIX, suffix.to_uppercase())
}

pub fn sign(secret: &[u8], payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(secret).ok()?;
    mac.update(payload);

    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let expected = match hex::decode(signature.trim()) {
        Ok(expected) => expected,
        Err(_) => return false,
    };
    let mut mac = match HmacSha512::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&expected).is_ok()
}

/// A webhook delivery; only the fields the service reacts to.
#[derive(Clone, Debug, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub data: WebhookData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookData {
    pub reference: String,
    #[serde(default)]
    pub amount: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct InitializeRequest<'a> {
    amount: Amount,
    email: &'a str,
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<&'a str>,
}

fn gateway_failure(err: reqwest::Error) -> Error {
    Error::PaymentGatewayFailed(err.to_string())
}

/// A Paystack-compatible client authenticated with the secret key.
#[derive(Clone, Debug)]
pub struct HttpPaymentGateway {
    client: Client,
    base_url: String,
    secret_key: String,
    callback_url: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(config: &GatewayConfig) -> Result<HttpPaymentGateway, Error> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(gateway_failure)?;

        Ok(HttpPaymentGateway {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
            callback_url: config.callback_url.clone(),
        })
    }

    async fn unwrap_envelope<T>(response: reqwest::Response) -> Result<T, Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        let status = response.status();
        let envelope: Envelope<T> = response.json().await.map_err(gateway_failure)?;

        match envelope.data {
            Some(data) if status.is_success() && envelope.status => Ok(data),
            _ => Err(Error::PaymentGatewayFailed(format!(
                "{}: {}",
                status, envelope.message
            ))),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[tracing::instrument(skip(self, email))]
    async fn initialize_transaction(
        &self,
        amount: Amount,
        reference: &str,
        email: &str,
    ) -> Result<TransactionInit, Error> {
        let response = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&InitializeRequest {
                amount,
                email,
                reference,
                callback_url: self.callback_url.as_deref(),
            })
            .send()
            .await
            .map_err(gateway_failure)?;

        let init: TransactionInit = Self::unwrap_envelope(response).await?;
        debug!(reference = %init.reference, "initialized transaction");

        Ok(init)
    }

    #[tracing::instrument(skip(self))]
    async fn verify_transaction(&self, reference: &str) -> Result<TransactionVerification, Error> {
        let response = self
            .client
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(gateway_failure)?;

        // the provider answers unknown references with a client error
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST
        ) {
            return Err(Error::PaymentReferenceNotFound {
                reference: reference.to_string(),
            });
        }

        Self::unwrap_envelope(response).await
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_signature(self.secret_key.as_bytes(), payload, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_prefixed_and_unique() {
        let first = generate_reference();
        let second = generate_reference();

        assert!(first.starts_with("ADF-"));
        assert_eq!(first.len(), 4 + REFERENCE_LENGTH);
        assert_ne!(first, second);
    }

    #[test]
    fn signature_round_trip() {
        let payload = br#"{"event":"charge.success","data":{"reference":"ADF-1"}}"#;
        let signature = sign(b"sk_test", payload).unwrap();

        assert!(verify_signature(b"sk_test", payload, &signature));
        assert!(!verify_signature(b"sk_other", payload, &signature));
        assert!(!verify_signature(b"sk_test", b"{}", &signature));
        assert!(!verify_signature(b"sk_test", payload, "not hex"));
    }

    #[test]
    fn unknown_statuses_are_tolerated() {
        let verification: TransactionVerification = serde_json::from_str(
            r#"{ "reference": "ADF-1", "status": "queued", "amount": 500 }"#,
        )
        .unwrap();

        assert_eq!(verification.status, TransactionStatus::Unknown);
    }

    #[test]
    fn webhook_event_parses_provider_payload() {
        let event: WebhookEvent = serde_json::from_str(
            r#"{ "event": "charge.success", "data": { "id": 1, "reference": "ADF-1", "amount": 10000, "status": "success" } }"#,
        )
        .unwrap();

        assert_eq!(event.event, CHARGE_SUCCESS);
        assert_eq!(event.data.reference, "ADF-1");
        assert_eq!(event.data.amount, Some(10_000));
    }
}
