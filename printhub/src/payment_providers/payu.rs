//! PayU REST API client
//!
//! Talks to the PayU "REST API 2.1": OAuth client-credentials tokens, order creation for BLIK
//! and card payments, order status lookups, capture, refunds and verification of the
//! `OpenPayu-Signature` notification header.
//!
//! Amounts are sent in the smallest currency unit (grosze for PLN) as strings.

use async_trait::async_trait;
use axum::http::HeaderMap;
use md5::Md5;
use reqwest::{Client, StatusCode, header::LOCATION};
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{
    config::PayUConfig,
    db::models::payments::PaymentMethod,
    payment_providers::{PaymentError, PaymentProvider, PaymentRequest, ProviderOrder, ProviderStatus, Result, WebhookEvent},
};

pub(crate) const OAUTH_PATH: &str = "/pl/standard/user/oauth/authorize";
pub(crate) const ORDERS_PATH: &str = "/api/v2_1/orders";
/// Tokens are refreshed this long before PayU says they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct PayUProvider {
    config: PayUConfig,
    http: Client,
    token: Mutex<Option<CachedToken>>,
}

impl PayUProvider {
    pub fn new(config: PayUConfig) -> Result<Self> {
        // PayU answers order creation with 302 + Location; we hand that URL to the customer
        let http = Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.as_str().trim_end_matches('/'), path)
    }

    /// Return a cached access token, fetching a new one when missing or about to expire.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Instant::now()
        {
            return Ok(token.access_token.clone());
        }

        let response = self
            .http
            .post(self.url(OAUTH_PATH))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::ProviderApi(format!("OAuth token request failed with {status}: {body}")));
        }

        let token: OAuthTokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!("Fetched PayU access token valid for {:?}", lifetime);

        *cached = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Turn a non-success response into an error, dropping the token on 401.
    async fn check_response(&self, response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error()
            && let Ok(envelope) = serde_json::from_str::<StatusEnvelope>(&body)
            && is_rejected_input(&envelope.status)
        {
            return Err(rejected_input_error(&envelope.status));
        }
        Err(PaymentError::ProviderApi(format!("{context} failed with {status}: {body}")))
    }

    fn expected_signature(&self, body: &str, algorithm: &str) -> Result<String> {
        let mut payload = String::with_capacity(body.len() + self.config.second_key.len());
        payload.push_str(body);
        payload.push_str(&self.config.second_key);

        match algorithm.to_ascii_uppercase().as_str() {
            "MD5" => Ok(format!("{:x}", Md5::digest(payload.as_bytes()))),
            "SHA256" | "SHA-256" => Ok(format!("{:x}", Sha256::digest(payload.as_bytes()))),
            other => Err(PaymentError::InvalidData(format!("Unsupported signature algorithm {other}"))),
        }
    }
}

/// Convert an amount to the smallest currency unit, as PayU expects.
pub fn to_minor_units(amount: Decimal) -> Result<String> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .map(|v| v.to_string())
        .ok_or_else(|| PaymentError::InvalidData(format!("Amount {amount} is out of range")))
}

fn parse_status(raw: &str) -> ProviderStatus {
    match raw {
        "NEW" => ProviderStatus::New,
        "WAITING_FOR_CONFIRMATION" => ProviderStatus::WaitingForConfirmation,
        "COMPLETED" => ProviderStatus::Completed,
        "CANCELED" | "REJECTED" => ProviderStatus::Canceled,
        _ => ProviderStatus::Pending,
    }
}

/// `SUCCESS` and the `WARNING_CONTINUE_*` family mean the order was accepted.
fn is_accepted(status_code: &str) -> bool {
    status_code == "SUCCESS" || status_code.starts_with("WARNING_CONTINUE")
}

/// The customer sent something PayU refuses, typically a mistyped or expired BLIK code.
fn is_rejected_input(status: &PayUStatus) -> bool {
    status.status_code == "ERROR_VALUE_INVALID"
        || status
            .code_literal
            .as_deref()
            .is_some_and(|code| code.starts_with("INVALID_BLIK") || code.starts_with("ERROR_AUTHORIZATION_CODE"))
}

fn rejected_input_error(status: &PayUStatus) -> PaymentError {
    let blik = status
        .code_literal
        .as_deref()
        .is_some_and(|code| code.contains("BLIK") || code.contains("AUTHORIZATION_CODE"));
    if blik {
        PaymentError::InvalidData("The BLIK code was rejected, generate a new code and try again".to_string())
    } else {
        PaymentError::InvalidData(format!(
            "Payment details rejected: {}",
            status.status_desc.as_deref().unwrap_or(&status.status_code)
        ))
    }
}

/// Parse `sender=checkout;signature=...;algorithm=MD5;content=DOCUMENT`.
fn parse_signature_header(value: &str) -> Option<(String, String)> {
    let mut signature = None;
    let mut algorithm = "MD5".to_string();
    for part in value.split(';') {
        match part.trim().split_once('=') {
            Some(("signature", v)) => signature = Some(v.trim().to_string()),
            Some(("algorithm", v)) => algorithm = v.trim().to_string(),
            _ => {}
        }
    }
    signature.map(|s| (s, algorithm))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayUStatus {
    status_code: String,
    #[serde(default)]
    status_desc: Option<String>,
    #[serde(default)]
    code_literal: Option<String>,
}

/// Error bodies carry only the `status` block
#[derive(Debug, Deserialize)]
struct StatusEnvelope {
    status: PayUStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderBody<'a> {
    notify_url: &'a str,
    continue_url: &'a str,
    customer_ip: &'a str,
    merchant_pos_id: &'a str,
    description: &'a str,
    currency_code: &'a str,
    total_amount: String,
    ext_order_id: String,
    buyer: BuyerBody<'a>,
    products: Vec<ProductBody<'a>>,
    pay_methods: PayMethods<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuyerBody<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<&'a str>,
    language: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProductBody<'a> {
    name: &'a str,
    unit_price: String,
    quantity: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayMethods<'a> {
    pay_method: PayMethod<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayMethod<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    authorization_code: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResponse {
    status: PayUStatus,
    #[serde(default)]
    redirect_uri: Option<String>,
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetrieveOrderResponse {
    orders: Vec<OrderStatusBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStatusBody {
    order_id: String,
    #[serde(default)]
    ext_order_id: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct NotificationBody {
    order: Option<OrderStatusBody>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdateBody<'a> {
    order_id: &'a str,
    order_status: &'a str,
}

#[derive(Debug, Serialize)]
struct RefundBody<'a> {
    refund: RefundDetails<'a>,
}

#[derive(Debug, Serialize)]
struct RefundDetails<'a> {
    description: &'a str,
    amount: String,
}

#[async_trait]
impl PaymentProvider for PayUProvider {
    fn name(&self) -> &'static str {
        "payu"
    }

    #[instrument(skip_all, fields(payment_id = %request.payment_id), err)]
    async fn create_payment(&self, request: &PaymentRequest) -> Result<ProviderOrder> {
        let pay_method = match (request.method, request.blik_code.as_deref()) {
            (PaymentMethod::Blik, Some(code)) => PayMethod {
                kind: "BLIK_AUTHORIZATION_CODE",
                value: "blik",
                authorization_code: Some(code),
            },
            (PaymentMethod::Blik, None) => PayMethod {
                kind: "PBL",
                value: "blik",
                authorization_code: None,
            },
            (PaymentMethod::Card, _) => PayMethod {
                kind: "PBL",
                value: "c",
                authorization_code: None,
            },
            (PaymentMethod::Credits, _) => {
                return Err(PaymentError::InvalidData("Credit payments are settled locally".to_string()));
            }
        };

        let products = request
            .items
            .iter()
            .map(|item| {
                Ok(ProductBody {
                    name: &item.name,
                    unit_price: to_minor_units(item.unit_price)?,
                    quantity: item.quantity.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let body = CreateOrderBody {
            notify_url: &request.notify_url,
            continue_url: &request.continue_url,
            customer_ip: &request.customer_ip,
            merchant_pos_id: &self.config.pos_id,
            description: &request.description,
            currency_code: &request.currency,
            total_amount: to_minor_units(request.amount)?,
            ext_order_id: request.payment_id.to_string(),
            buyer: BuyerBody {
                email: &request.buyer.email,
                first_name: request.buyer.first_name.as_deref(),
                last_name: request.buyer.last_name.as_deref(),
                phone: request.buyer.phone.as_deref(),
                language: &self.config.language,
            },
            products,
            pay_methods: PayMethods { pay_method },
        };

        let token = self.access_token().await?;
        let response = self.http.post(self.url(ORDERS_PATH)).bearer_auth(token).json(&body).send().await?;
        let response = self.check_response(response, "Order creation").await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let parsed: CreateOrderResponse = response.json().await?;

        if is_rejected_input(&parsed.status) {
            return Err(rejected_input_error(&parsed.status));
        }
        if !is_accepted(&parsed.status.status_code) {
            return Err(PaymentError::ProviderApi(format!(
                "Order rejected: {} {}",
                parsed.status.status_code,
                parsed.status.status_desc.unwrap_or_default()
            )));
        }

        let provider_order_id = parsed
            .order_id
            .ok_or_else(|| PaymentError::ProviderApi("Order creation response without orderId".to_string()))?;

        Ok(ProviderOrder {
            provider_order_id,
            redirect_url: parsed.redirect_uri.or(location),
            status: ProviderStatus::Pending,
        })
    }

    #[instrument(skip(self), err)]
    async fn get_payment_status(&self, provider_order_id: &str) -> Result<ProviderStatus> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.url(&format!("{ORDERS_PATH}/{provider_order_id}")))
            .bearer_auth(token)
            .send()
            .await?;
        let response = self.check_response(response, "Order lookup").await?;

        let parsed: RetrieveOrderResponse = response.json().await?;
        let order = parsed
            .orders
            .into_iter()
            .find(|o| o.order_id == provider_order_id)
            .ok_or_else(|| PaymentError::ProviderApi(format!("Order {provider_order_id} missing from lookup response")))?;

        Ok(parse_status(&order.status))
    }

    fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>> {
        let header = headers
            .get("OpenPayu-Signature")
            .or_else(|| headers.get("X-OpenPayU-Signature"))
            .and_then(|v| v.to_str().ok())
            .ok_or(PaymentError::InvalidSignature)?;

        let (signature, algorithm) = parse_signature_header(header).ok_or(PaymentError::InvalidSignature)?;
        let expected = self.expected_signature(body, &algorithm)?;

        if !constant_time_eq(expected.as_bytes(), signature.to_ascii_lowercase().as_bytes()) {
            warn!("PayU notification signature mismatch");
            return Err(PaymentError::InvalidSignature);
        }

        let notification: NotificationBody =
            serde_json::from_str(body).map_err(|e| PaymentError::InvalidData(format!("Malformed notification: {e}")))?;

        // Refund notifications carry no order block
        Ok(notification.order.map(|order| WebhookEvent {
            status: parse_status(&order.status),
            provider_order_id: order.order_id,
            ext_order_id: order.ext_order_id,
        }))
    }

    #[instrument(skip(self), err)]
    async fn capture(&self, provider_order_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .put(self.url(&format!("{ORDERS_PATH}/{provider_order_id}/status")))
            .bearer_auth(token)
            .json(&StatusUpdateBody {
                order_id: provider_order_id,
                order_status: "COMPLETED",
            })
            .send()
            .await?;
        let response = self.check_response(response, "Capture").await?;

        let status: serde_json::Value = response.json().await?;
        match status.pointer("/status/statusCode").and_then(|v| v.as_str()) {
            Some(code) if is_accepted(code) => Ok(()),
            other => Err(PaymentError::ProviderApi(format!("Capture rejected: {other:?}"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, provider_order_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(self.url(&format!("{ORDERS_PATH}/{provider_order_id}")))
            .bearer_auth(token)
            .send()
            .await?;
        self.check_response(response, "Cancel").await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn refund(&self, provider_order_id: &str, amount: Decimal, description: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url(&format!("{ORDERS_PATH}/{provider_order_id}/refunds")))
            .bearer_auth(token)
            .json(&RefundBody {
                refund: RefundDetails {
                    description,
                    amount: to_minor_units(amount)?,
                },
            })
            .send()
            .await?;
        let response = self.check_response(response, "Refund").await?;

        let status: serde_json::Value = response.json().await?;
        match status.pointer("/status/statusCode").and_then(|v| v.as_str()) {
            Some(code) if is_accepted(code) => Ok(()),
            other => Err(PaymentError::ProviderApi(format!("Refund rejected: {other:?}"))),
        }
    }

    fn auto_capture(&self) -> bool {
        self.config.auto_capture
    }
}
