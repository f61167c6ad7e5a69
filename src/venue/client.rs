// =============================================================================
// Venue Adapter — typed operations over a Binance-USDⓈ-M-style perpetual
// futures REST API. Signing and HTTP plumbing are grounded directly on the
// teacher's binance/client.rs; endpoints and semantics are generalized from
// spot `/api/v3/*` to futures `/fapi/v1/*` + `/fapi/v2/*` with position-side
// awareness. Every outgoing price/quantity is rounded through `InstrumentInfo`
// before submission; every call is wrapped by `venue::retry::retry_with_backoff`.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::instrument::InstrumentInfo;
use crate::types::{OrderId, PositionSnapshot, Side};
use crate::venue::retry::retry_with_backoff;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

/// Perpetual futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct VenueAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    symbol: String,
    instrument: InstrumentInfo,
}

impl VenueAdapter {
    /// Connects, fetches instrument metadata, and applies leverage + the
    /// hedge/one-way position mode the configured strategy needs. Fatal on
    /// any error other than "already set" — a broken venue handshake must
    /// prevent the HTTP listener from ever opening.
    #[instrument(skip(api_key, secret), name = "venue::initialize")]
    pub async fn initialize(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        symbol: &str,
        leverage: u32,
        hedge_mode: bool,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let secret = secret.into();
        let symbol = crate::instrument::normalize_symbol(symbol);

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build venue HTTP client")?;

        let mut adapter = Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
            symbol: symbol.clone(),
            instrument: InstrumentInfo {
                qty_step: Decimal::ONE,
                min_qty: Decimal::ONE,
                max_qty: None,
                qty_precision: 0,
                price_tick: Decimal::ONE,
                price_precision: 0,
            },
        };

        adapter.instrument = adapter.fetch_instrument_info(&symbol).await?;
        adapter.set_leverage(&symbol, leverage).await?;

        match adapter.set_position_mode(hedge_mode).await {
            Ok(()) => {}
            Err(err) if crate::venue::retry::is_mode_change_blocked_by_position(&err) => {
                warn!(error = %err, "position mode change deferred: an existing position blocks it");
            }
            Err(err) => return Err(err).context("failed to set position mode"),
        }

        Ok(adapter)
    }

    pub fn instrument(&self) -> &InstrumentInfo {
        &self.instrument
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    // -------------------------------------------------------------------------
    // Signing helpers (unchanged from the teacher's scheme)
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn get_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET {path} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.with_context(|| format!("failed to parse {path} response"))?;
        if !status.is_success() {
            anyhow::bail!("venue GET {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn post_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.post(&url).send().await.with_context(|| format!("POST {path} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.with_context(|| format!("failed to parse {path} response"))?;
        if !status.is_success() {
            anyhow::bail!("venue POST {path} returned {status}: {body}");
        }
        Ok(body)
    }

    async fn delete_signed(&self, path: &str, params: &str) -> Result<serde_json::Value> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        let resp = self.client.delete(&url).send().await.with_context(|| format!("DELETE {path} request failed"))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.with_context(|| format!("failed to parse {path} response"))?;
        if !status.is_success() {
            anyhow::bail!("venue DELETE {path} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "venue::fetch_instrument_info")]
    async fn fetch_instrument_info(&self, symbol: &str) -> Result<InstrumentInfo> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let body = retry_with_backoff("fetch_instrument_info", || {
            let url = &url;
            async move {
                let resp = self.client.get(url).send().await.context("GET /fapi/v1/exchangeInfo request failed")?;
                let status = resp.status();
                let body: serde_json::Value = resp.json().await.context("failed to parse exchangeInfo response")?;
                if !status.is_success() {
                    anyhow::bail!("venue GET /fapi/v1/exchangeInfo returned {status}: {body}");
                }
                Ok(body)
            }
        })
        .await?;

        let entry = body["symbols"]
            .as_array()
            .and_then(|arr| arr.iter().find(|s| s["symbol"].as_str() == Some(symbol)))
            .with_context(|| format!("symbol {symbol} not found in exchangeInfo"))?;

        let filters = entry["filters"].as_array().context("symbol entry missing filters")?;

        let lot = filters
            .iter()
            .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"))
            .context("missing LOT_SIZE filter")?;
        let price = filters
            .iter()
            .find(|f| f["filterType"].as_str() == Some("PRICE_FILTER"))
            .context("missing PRICE_FILTER filter")?;

        let qty_step = parse_decimal(&lot["stepSize"])?;
        let min_qty = parse_decimal(&lot["minQty"])?;
        let max_qty = lot.get("maxQty").and_then(|v| parse_decimal(v).ok());
        let price_tick = parse_decimal(&price["tickSize"])?;

        let qty_precision = entry["quantityPrecision"].as_u64().unwrap_or(scale_of(qty_step) as u64) as u32;
        let price_precision = entry["pricePrecision"].as_u64().unwrap_or(scale_of(price_tick) as u64) as u32;

        debug!(symbol, %qty_step, %min_qty, %price_tick, "instrument info resolved");

        Ok(InstrumentInfo {
            qty_step,
            min_qty,
            max_qty,
            qty_precision,
            price_tick,
            price_precision,
        })
    }

    #[instrument(skip(self), name = "venue::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        retry_with_backoff("set_leverage", || async {
            match self.post_signed("/fapi/v1/leverage", &params).await {
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// Sets one-way/hedge position mode. Idempotent per spec.md §8's
    /// round-trip law: a second call requesting the mode already in effect
    /// ("no need to change position side") is translated to success here,
    /// not left for the caller to reinterpret.
    #[instrument(skip(self), name = "venue::set_position_mode")]
    pub async fn set_position_mode(&self, hedge_mode: bool) -> Result<()> {
        let dual = if hedge_mode { "true" } else { "false" };
        let params = format!("dualSidePosition={dual}");
        match retry_with_backoff("set_position_mode", || {
            let params = &params;
            async move { self.post_signed("/fapi/v1/positionSide/dual", params).await.map(|_| ()) }
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(err) if retry_envelope_says_noop(&err) => {
                debug!("position mode already set as requested");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // -------------------------------------------------------------------------
    // Position & order queries
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "venue::get_current_position")]
    pub async fn get_current_position(&self, side: Option<Side>) -> Result<Option<PositionSnapshot>> {
        let symbol = self.symbol.clone();
        let body = retry_with_backoff("get_current_position", || {
            let params = format!("symbol={symbol}");
            async move { self.get_signed("/fapi/v2/positionRisk", &params).await }
        })
        .await?;

        let entries = body.as_array().cloned().unwrap_or_default();
        for entry in entries {
            let amt = parse_decimal(&entry["positionAmt"]).unwrap_or(Decimal::ZERO);
            if amt.is_zero() {
                continue;
            }
            let entry_side = if amt > Decimal::ZERO { Side::Long } else { Side::Short };
            if let Some(want) = side {
                if want != entry_side {
                    continue;
                }
            }
            let entry_price = parse_decimal(&entry["entryPrice"]).unwrap_or_default();
            let unrealized_pnl = parse_decimal(&entry["unRealizedProfit"]).unwrap_or_default();
            return Ok(Some(PositionSnapshot {
                side: entry_side,
                size: amt.abs(),
                entry_price,
                unrealized_pnl,
            }));
        }
        Ok(None)
    }

    #[instrument(skip(self), name = "venue::get_exact_entry_price")]
    pub async fn get_exact_entry_price(&self, side: Option<Side>) -> Result<Option<Decimal>> {
        Ok(self.get_current_position(side).await?.map(|p| p.entry_price))
    }

    #[instrument(skip(self), name = "venue::get_open_orders")]
    pub async fn get_open_orders(&self) -> Result<Vec<serde_json::Value>> {
        let symbol = self.symbol.clone();
        retry_with_backoff("get_open_orders", || {
            let params = format!("symbol={symbol}");
            async move {
                let body = self.get_signed("/fapi/v1/openOrders", &params).await?;
                Ok(body.as_array().cloned().unwrap_or_default())
            }
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "venue::open_market")]
    pub async fn open_market(&self, side: Side, quantity: Decimal, position_side: Option<Side>) -> Result<()> {
        let quantity = self.instrument.round_quantity(quantity)?;
        let order_side = side_to_order_side(side);
        let symbol = self.symbol.clone();
        let position_side_str = position_side.map(position_side_label);

        retry_with_backoff("open_market", || {
            let mut params = format!("symbol={symbol}&side={order_side}&type=MARKET&quantity={quantity}");
            if let Some(ps) = &position_side_str {
                params.push_str(&format!("&positionSide={ps}"));
            }
            async move { self.post_signed("/fapi/v1/order", &params).await.map(|_| ()) }
        })
        .await
    }

    /// Closes a specific hedge-mode position side with a reduce-by-market
    /// order. In hedge mode, opening the opposite *order* side with the
    /// same `positionSide` reduces (rather than reverses) that leg — unlike
    /// one-way mode, where `open_market` alone governs net exposure.
    #[instrument(skip(self), name = "venue::close_position_market")]
    pub async fn close_position_market(&self, position_side: Side, quantity: Decimal) -> Result<()> {
        let quantity = self.instrument.round_quantity(quantity)?;
        let close_side = side_to_order_side(position_side.opposite());
        let symbol = self.symbol.clone();
        let ps_label = position_side_label(position_side);

        retry_with_backoff("close_position_market", || {
            let params = format!(
                "symbol={symbol}&side={close_side}&type=MARKET&quantity={quantity}&positionSide={ps_label}"
            );
            async move { self.post_signed("/fapi/v1/order", &params).await.map(|_| ()) }
        })
        .await
    }

    #[instrument(skip(self), name = "venue::place_stop_market")]
    pub async fn place_stop_market(&self, position_side: Side, stop_price: Decimal) -> Result<OrderId> {
        let stop_price = self.instrument.round_price(stop_price);
        let close_side = side_to_order_side(position_side.opposite());
        let symbol = self.symbol.clone();
        let ps_label = position_side_label(position_side);

        retry_with_backoff("place_stop_market", || {
            let params = format!(
                "symbol={symbol}&side={close_side}&type=STOP_MARKET&stopPrice={stop_price}&closePosition=true&positionSide={ps_label}&workingType=MARK_PRICE&priceProtect=true"
            );
            async move {
                let body = self.post_signed("/fapi/v1/order", &params).await?;
                extract_order_id(&body)
            }
        })
        .await
    }

    #[instrument(skip(self), name = "venue::place_stop_limit")]
    pub async fn place_stop_limit(
        &self,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
        limit_price: Decimal,
    ) -> Result<OrderId> {
        let quantity = self.instrument.round_quantity(quantity)?;
        let stop_price = self.instrument.round_price(stop_price);
        let limit_price = self.instrument.round_price(limit_price);
        let order_side = side_to_order_side(side);
        let symbol = self.symbol.clone();

        retry_with_backoff("place_stop_limit", || {
            let params = format!(
                "symbol={symbol}&side={order_side}&type=STOP&quantity={quantity}&stopPrice={stop_price}&price={limit_price}&reduceOnly=true&timeInForce=GTE_GTC&workingType=MARK_PRICE&priceProtect=true"
            );
            async move {
                let body = self.post_signed("/fapi/v1/order", &params).await?;
                extract_order_id(&body)
            }
        })
        .await
    }

    #[instrument(skip(self), name = "venue::place_limit")]
    pub async fn place_limit(&self, side: Side, quantity: Decimal, price: Decimal) -> Result<OrderId> {
        let quantity = self.instrument.round_quantity(quantity)?;
        let price = self.instrument.round_price(price);
        let order_side = side_to_order_side(side);
        let symbol = self.symbol.clone();

        retry_with_backoff("place_limit", || {
            let params = format!(
                "symbol={symbol}&side={order_side}&type=LIMIT&quantity={quantity}&price={price}&reduceOnly=true&timeInForce=GTC"
            );
            async move {
                let body = self.post_signed("/fapi/v1/order", &params).await?;
                extract_order_id(&body)
            }
        })
        .await
    }

    #[instrument(skip(self), name = "venue::cancel_order")]
    pub async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let symbol = self.symbol.clone();
        let order_id = order_id.to_string();
        match retry_with_backoff("cancel_order", || {
            let params = format!("symbol={symbol}&orderId={order_id}");
            async move { self.delete_signed("/fapi/v1/order", &params).await.map(|_| ()) }
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(err) if retry_envelope_says_noop(&err) => {
                debug!(order_id, "order already absent, treating cancel as success");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self), name = "venue::cancel_all_stops")]
    pub async fn cancel_all_stops(&self) -> Result<()> {
        let orders = self.get_open_orders().await?;
        for order in orders {
            let order_type = order["type"].as_str().unwrap_or_default();
            if order_type != "STOP" && order_type != "STOP_MARKET" {
                continue;
            }
            if let Some(order_id) = order["orderId"].as_u64() {
                if let Err(err) = self.cancel_order(&order_id.to_string()).await {
                    warn!(order_id, error = %err, "failed to cancel stop order during cleanup");
                }
            }
        }
        Ok(())
    }
}

fn retry_envelope_says_noop(err: &anyhow::Error) -> bool {
    crate::venue::retry::is_idempotent_noop(err)
}

fn side_to_order_side(side: Side) -> &'static str {
    match side {
        Side::Long => "BUY",
        Side::Short => "SELL",
    }
}

fn position_side_label(side: Side) -> &'static str {
    match side {
        Side::Long => "LONG",
        Side::Short => "SHORT",
    }
}

fn parse_decimal(val: &serde_json::Value) -> Result<Decimal> {
    if let Some(s) = val.as_str() {
        Decimal::from_str(s).with_context(|| format!("failed to parse '{s}' as decimal"))
    } else if let Some(n) = val.as_f64() {
        Decimal::from_str(&n.to_string()).context("failed to parse numeric value as decimal")
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

fn scale_of(value: Decimal) -> u32 {
    value.scale()
}

fn extract_order_id(body: &serde_json::Value) -> Result<OrderId> {
    body["orderId"]
        .as_u64()
        .map(|id| id.to_string())
        .context("venue response missing orderId")
}

impl std::fmt::Debug for VenueAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("symbol", &self.symbol)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_side_maps_long_to_buy_and_short_to_sell() {
        assert_eq!(side_to_order_side(Side::Long), "BUY");
        assert_eq!(side_to_order_side(Side::Short), "SELL");
    }

    #[test]
    fn position_side_label_matches_venue_vocabulary() {
        assert_eq!(position_side_label(Side::Long), "LONG");
        assert_eq!(position_side_label(Side::Short), "SHORT");
    }

    #[test]
    fn parses_decimal_from_string_and_numeric_json_values() {
        assert_eq!(parse_decimal(&serde_json::json!("4000.50")).unwrap(), dec!(4000.50));
        assert_eq!(parse_decimal(&serde_json::json!(12)).unwrap(), dec!(12));
        assert!(parse_decimal(&serde_json::json!(null)).is_err());
    }

    #[test]
    fn extracts_order_id_from_numeric_field() {
        let body = serde_json::json!({ "orderId": 123456789u64, "status": "NEW" });
        assert_eq!(extract_order_id(&body).unwrap(), "123456789");
    }

    #[test]
    fn extract_order_id_fails_when_field_missing() {
        let body = serde_json::json!({ "status": "NEW" });
        assert!(extract_order_id(&body).is_err());
    }

    #[test]
    fn scale_of_reports_decimal_places() {
        assert_eq!(scale_of(dec!(0.001)), 3);
        assert_eq!(scale_of(dec!(1)), 0);
    }
}
