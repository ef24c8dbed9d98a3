//! REST venue client

use super::{Order, OrderAck, OrderSide, OrderType, VenueError, VenueExecutor};
use crate::config::VenueConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Wire body for `POST /order`
#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    client_id: Uuid,
    market: &'a str,
    token: &'a str,
    side: OrderSide,
    size: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Decimal>,
    #[serde(rename = "type")]
    order_type: OrderType,
    tif: &'static str,
}

/// HTTP client for the venue order API
pub struct RestVenue {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl RestVenue {
    pub fn new(config: &VenueConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.order_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn classify_status(status: StatusCode, body: String) -> VenueError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VenueError::Auth(body),
            StatusCode::NOT_FOUND => VenueError::UnknownMarket(body),
            s if s.is_client_error() => VenueError::Rejected(body),
            _ => VenueError::Transient(body),
        }
    }

    fn classify_transport(error: reqwest::Error) -> VenueError {
        if error.is_timeout() {
            VenueError::Timeout
        } else {
            VenueError::Transient(error.to_string())
        }
    }
}

#[async_trait]
impl VenueExecutor for RestVenue {
    async fn place_order(&self, order: &Order) -> Result<OrderAck, VenueError> {
        let body = OrderRequest {
            client_id: order.client_id,
            market: &order.market_id,
            token: &order.token_id,
            side: order.side,
            size: order.size,
            price: order.price,
            order_type: order.order_type,
            tif: match order.order_type {
                OrderType::Market => "ioc",
                OrderType::LimitPostOnly => "gtc",
            },
        };

        let response = self
            .client
            .post(format!("{}/order", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, detail));
        }

        response
            .json::<OrderAck>()
            .await
            .map_err(|e| VenueError::Transient(format!("malformed order ack: {e}")))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
        let response = self
            .client
            .delete(format!("{}/order/{}", self.base_url, order_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, detail));
        }
        Ok(())
    }
}
