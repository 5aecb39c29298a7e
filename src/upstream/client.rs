// =============================================================================
// Signed, rate-limited HTTP client to the upstream auction site
// =============================================================================
//
// Structurally grounded on `binance/client.rs`: a `reqwest::Client` field,
// a signer, `#[instrument(skip(self))]` on every public method, and a
// redacting `Debug` impl so the session cookie never lands in a log line.

use crate::errors::{RejectionReason, UpstreamError};
use crate::types::{AuctionSnapshot, BidOutcome};
use crate::upstream::signing::{Signer, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub struct UpstreamClient {
    http: reqwest::Client,
    signer: Signer,
    base_url: String,
    api_url: String,
    session_cookie: RwLock<Option<String>>,
    limiter: Arc<DirectRateLimiter>,
}

/// Redacts the session cookie; mirrors teacher's custom `Debug` for
/// `BinanceClient` which never prints API secrets.
impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("base_url", &self.base_url)
            .field("api_url", &self.api_url)
            .field("session_cookie", &"<redacted>")
            .finish()
    }
}

impl UpstreamClient {
    pub fn new(
        base_url: impl Into<String>,
        api_url: impl Into<String>,
        signing_secret: impl Into<String>,
        requests_per_minute: u32,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute.max(1)).expect("checked non-zero above"),
        );
        Ok(Self {
            http,
            signer: Signer::new(signing_secret),
            base_url: base_url.into(),
            api_url: api_url.into(),
            session_cookie: RwLock::new(None),
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn set_session_cookie(&self, cookie: Option<String>) {
        *self.session_cookie.write() = cookie;
    }

    pub fn session_cookie(&self) -> Option<String> {
        self.session_cookie.read().clone()
    }

    fn cookie_header(&self) -> Option<String> {
        self.session_cookie.read().clone()
    }

    fn sign_request(
        &self,
        builder: reqwest::RequestBuilder,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> reqwest::RequestBuilder {
        let (signature, timestamp_ms) = self.signer.sign(method, path, body);
        let mut builder = builder
            .header(SIGNATURE_HEADER, signature)
            .header(TIMESTAMP_HEADER, timestamp_ms.to_string());
        if let Some(cookie) = self.cookie_header() {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        builder
    }

    #[instrument(skip(self), name = "upstream::fetch_auction")]
    pub async fn fetch_auction(&self, id: &str) -> Result<ProductFetch, UpstreamError> {
        if self.limiter.check().is_err() {
            return Err(UpstreamError::RateLimited);
        }

        let path = format!("/p/product/{id}");
        let url = format!("{}{}?_data=routes/p.product.$id", self.base_url, path);
        let builder = self.http.get(&url);
        let builder = self.sign_request(builder, "GET", &path, b"");

        let resp = builder
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if resp.status().is_server_error() {
            return Err(UpstreamError::Transport(format!(
                "upstream 5xx: {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(UpstreamError::Rejected(
                RejectionReason::UpstreamError,
                format!("unexpected status: {}", resp.status()),
            ));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let mut product = parse_product_payload(&body)?;
        // `id`/`title`/`photos[0].url` come straight off the payload;
        // `url` has no upstream field of its own and is the product detail
        // page this client fetched the payload from in the first place.
        product.url = format!("{}{}", self.base_url, path);
        Ok(product)
    }

    #[instrument(skip(self), name = "upstream::place_bid")]
    pub async fn place_bid(&self, id: &str, amount: u64) -> Result<BidOutcome, UpstreamError> {
        if self.limiter.check().is_err() {
            return Err(UpstreamError::RateLimited);
        }

        let path = format!("/auctions/{id}/bid");
        let url = format!("{}{}", self.api_url, path);
        let body = serde_json::json!({ "amount": amount });
        let body_bytes = serde_json::to_vec(&body).unwrap_or_default();

        let builder = self.http.post(&url).json(&body);
        let builder = self.sign_request(builder, "POST", &path, &body_bytes);

        let resp = match builder.send().await {
            Ok(r) => r,
            Err(_) => return Ok(BidOutcome::TransportError),
        };

        if resp.status().is_server_error() {
            return Ok(BidOutcome::TransportError);
        }
        if resp.status() == reqwest::StatusCode::FORBIDDEN
            || resp.status() == reqwest::StatusCode::UNAUTHORIZED
        {
            return Err(UpstreamError::Rejected(
                RejectionReason::NotAuthenticated,
                "not authenticated".into(),
            ));
        }

        let body: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(_) => return Ok(BidOutcome::TransportError),
        };

        Ok(interpret_bid_response(&body))
    }
}

/// Resolves DESIGN.md Open Question #1: unknown success bodies are treated
/// as `Accepted` unless `data.minimumNextBid` is present, in which case the
/// bid is recorded as `AcceptedButOutbid`.
fn interpret_bid_response(body: &serde_json::Value) -> BidOutcome {
    if let Some(reason) = body.get("error").and_then(|v| v.as_str()) {
        return BidOutcome::Rejected {
            reason: reason.to_string(),
        };
    }

    let data = body.get("data");
    let minimum_next_bid = data
        .and_then(|d| d.get("minimumNextBid"))
        .and_then(|v| v.as_u64());

    match minimum_next_bid {
        Some(new_minimum_next_bid) => {
            let new_current = data
                .and_then(|d| d.get("currentAmount"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            BidOutcome::AcceptedButOutbid {
                new_current,
                new_minimum_next_bid,
            }
        }
        None => BidOutcome::Accepted,
    }
}

/// The descriptive fields of an auction (spec.md §3: "`id`, `title`, `url`,
/// `imageUrl` — descriptive, immutable once set") plus the snapshot parsed
/// from the same payload. `url` is left empty here — it isn't a field on
/// the upstream payload itself, only `fetch_auction` (which knows the
/// `base_url` it was fetched from) can fill it in.
#[derive(Debug, Clone)]
pub struct ProductFetch {
    pub id: String,
    pub title: String,
    pub url: String,
    pub image_url: String,
    pub snapshot: AuctionSnapshot,
}

/// Parses the upstream product payload, consuming only the fields named in
/// spec.md §6 and tolerating any others, per the "duck-typed upstream
/// payloads" design note — mirrors the teacher's `parse_agg_trade`, which
/// indexes into a raw `serde_json::Value` rather than deriving a struct for
/// the entire upstream schema. `id`/`title`/`photos[0].url` default to
/// empty when absent: the bid/closed SSE event bodies reuse this parser via
/// `wrap_product` and don't carry them, only `currentPrice`/`userState`/etc.
pub fn parse_product_payload(body: &serde_json::Value) -> Result<ProductFetch, UpstreamError> {
    let product = body
        .get("product")
        .ok_or_else(|| UpstreamError::Validation("missing `product` object".into()))?;

    let id = product
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let title = product
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let image_url = product
        .get("photos")
        .and_then(|v| v.get(0))
        .and_then(|p| p.get("url"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let current_bid = product
        .get("currentPrice")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| UpstreamError::Validation("missing currentPrice".into()))?;

    let user_state = product.get("userState");
    let next_bid = user_state
        .and_then(|u| u.get("nextBid"))
        .and_then(|v| v.as_u64())
        .ok_or_else(|| UpstreamError::Validation("missing userState.nextBid".into()))?;

    let bid_count = product.get("bidCount").and_then(|v| v.as_u64()).unwrap_or(0);
    let bidder_count = product
        .get("bidderCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let is_winning = user_state
        .and_then(|u| u.get("isWinning"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let is_watching = user_state
        .and_then(|u| u.get("isWatching"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let is_closed = product
        .get("isClosed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let retail_price = product
        .get("retailPrice")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let extension_interval_seconds = product
        .get("extensionInterval")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let close_at = product
        .get("closeTime")
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| UpstreamError::Validation("missing/invalid closeTime.value".into()))?;

    Ok(ProductFetch {
        id,
        title,
        url: String::new(),
        image_url,
        snapshot: AuctionSnapshot {
            current_bid,
            next_bid,
            bid_count,
            bidder_count,
            is_winning,
            is_watching,
            is_closed,
            close_at,
            retail_price,
            extension_interval_seconds,
            last_updated_at: Utc::now(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bid_response_without_minimum_next_bid_is_accepted() {
        let body = json!({ "success": true });
        assert_eq!(interpret_bid_response(&body), BidOutcome::Accepted);
    }

    #[test]
    fn bid_response_with_minimum_next_bid_is_outbid() {
        let body = json!({ "data": { "currentAmount": 60, "minimumNextBid": 61 } });
        assert_eq!(
            interpret_bid_response(&body),
            BidOutcome::AcceptedButOutbid {
                new_current: 60,
                new_minimum_next_bid: 61
            }
        );
    }

    #[test]
    fn bid_response_with_error_is_rejected() {
        let body = json!({ "error": "auction closed" });
        assert_eq!(
            interpret_bid_response(&body),
            BidOutcome::Rejected {
                reason: "auction closed".into()
            }
        );
    }

    #[test]
    fn parse_product_payload_tolerates_unknown_fields() {
        let body = json!({
            "product": {
                "id": "A",
                "currentPrice": 50,
                "userState": { "nextBid": 51, "isWinning": false, "isWatching": true },
                "bidCount": 3,
                "bidderCount": 2,
                "isClosed": false,
                "closeTime": { "value": "2026-08-01T00:00:00Z" },
                "retailPrice": 200,
                "extensionInterval": 120,
                "somethingUnexpected": { "nested": true }
            }
        });
        let fetch = parse_product_payload(&body).unwrap();
        assert_eq!(fetch.snapshot.current_bid, 50);
        assert_eq!(fetch.snapshot.next_bid, 51);
        assert_eq!(fetch.id, "A");
    }

    #[test]
    fn parse_product_payload_rejects_missing_required_field() {
        let body = json!({ "product": { "currentPrice": 50 } });
        assert!(parse_product_payload(&body).is_err());
    }

    #[test]
    fn parse_product_payload_extracts_title_and_photo_url() {
        let body = json!({
            "product": {
                "id": "A1",
                "title": "Vintage Lamp",
                "photos": [{ "url": "https://cdn.example.invalid/a1.jpg" }],
                "currentPrice": 50,
                "userState": { "nextBid": 51 },
                "closeTime": { "value": "2026-08-01T00:00:00Z" }
            }
        });
        let fetch = parse_product_payload(&body).unwrap();
        assert_eq!(fetch.id, "A1");
        assert_eq!(fetch.title, "Vintage Lamp");
        assert_eq!(fetch.image_url, "https://cdn.example.invalid/a1.jpg");
        // `url` is only filled in by `fetch_auction`, which knows base_url.
        assert_eq!(fetch.url, "");
    }

    #[test]
    fn parse_product_payload_defaults_descriptive_fields_when_absent() {
        // Bid/closed SSE deltas reuse this parser without id/title/photos.
        let body = json!({
            "product": {
                "currentPrice": 50,
                "userState": { "nextBid": 51 },
                "closeTime": { "value": "2026-08-01T00:00:00Z" }
            }
        });
        let fetch = parse_product_payload(&body).unwrap();
        assert_eq!(fetch.id, "");
        assert_eq!(fetch.title, "");
        assert_eq!(fetch.image_url, "");
    }
}
