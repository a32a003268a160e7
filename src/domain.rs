// ===============================
// src/domain.rs
// ===============================
//
// Shared domain types: market primitives, instruments, positions,
// execution reports and market updates as delivered by the transport.
// Prices and volumes are plain f64; "absent" is always Option, never a
// sentinel value.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Tolerance used for price/volume comparisons across the crate.
pub const DOUBLE_EPSILON: f64 = 1e-3;

pub fn double_equals(a: f64, b: f64) -> bool {
    (a - b).abs() < DOUBLE_EPSILON
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    /// Integer code used in the levels file: 1 = buy, 2 = sell.
    pub fn level_code(&self) -> i32 {
        match self {
            Side::Buy => 1,
            Side::Sell => 2,
        }
    }

    pub fn from_level_code(code: i32) -> Option<Side> {
        match code {
            1 => Some(Side::Buy),
            2 => Some(Side::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionKind {
    Call,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketAction {
    New,
    Change,
    Delete,
}

/// Top of book. Either side may be missing independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bbo {
    pub bid_volume: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub ask_volume: Option<f64>,
}

impl Bbo {
    /// Mid price, only when both sides are quoted.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) * 0.5),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub description: String,
    /// "OPT", "FUT", "PERP", ...
    pub security_type: String,
    pub main_currency: String,
    pub contract_multiplier: Option<f64>,
    pub put_call: Option<OptionKind>,
    pub strike_price: Option<f64>,
    pub strike_currency: Option<String>,
    pub maturity_date: Option<NaiveDate>,
    pub min_trade_volume: Option<f64>,
    pub tick_size: Option<f64>,
    pub bbo: Option<Bbo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub side: Side,
    pub settlement_price: f64,
    pub underlying_end_price: f64,
}

impl Position {
    /// A zero-quantity placeholder for an instrument we do not hold.
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity: 0.0,
            side: Side::Buy,
            settlement_price: 0.0,
            underlying_end_price: 0.0,
        }
    }

    pub fn signed_quantity(&self) -> f64 {
        self.quantity * self.side.sign()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: Option<String>,
    pub original_order_id: Option<String>,
    pub order_status: Option<OrderStatus>,
    pub side: Option<Side>,
    pub symbol: Option<String>,
    pub order_type: Option<OrderType>,
    pub order_price: Option<f64>,
    pub order_volume: Option<f64>,
    /// Cumulative executed volume on the order.
    pub executed_volume: Option<f64>,
    /// Volume still open on the order.
    pub open_volume: Option<f64>,
    pub average_execution_price: Option<f64>,
    pub mass_status_request_type: Option<i32>,
    pub mass_status_report_number: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdateLevel {
    pub action: MarketAction,
    pub side: MarketSide,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub symbol: String,
    pub updates: Vec<MarketUpdateLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelReject {
    pub order_id: String,
    pub original_order_id: String,
    pub order_status: Option<OrderStatus>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassCancelReport {
    pub order_id: String,
    pub accepted: bool,
    pub reject_reason: Option<String>,
}

/// The single hedge order the strategy may have working at the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingOrder {
    /// Latest client order id assigned by the exchange flow.
    pub id: String,
    /// Client id the order was originally sent with.
    pub original_id: String,
    pub side: Side,
    pub order_price: f64,
    /// Cumulative volume observed filled so far.
    pub full_volume: f64,
    pub open_volume: f64,
}

impl std::fmt::Display for WorkingOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} [{}] {} #{} [{}]",
            self.side, self.id, self.original_id, self.order_price, self.full_volume, self.open_volume
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mid_requires_both_sides() {
        let bbo = Bbo { bid: Some(10.0), ask: Some(12.0), ..Default::default() };
        assert_eq!(bbo.mid(), Some(11.0));

        let one_sided = Bbo { bid: Some(10.0), ..Default::default() };
        assert_eq!(one_sided.mid(), None);
        assert_eq!(Bbo::default().mid(), None);
    }

    #[test]
    fn side_level_codes_round_trip() {
        assert_eq!(Side::from_level_code(Side::Buy.level_code()), Some(Side::Buy));
        assert_eq!(Side::from_level_code(Side::Sell.level_code()), Some(Side::Sell));
        assert_eq!(Side::from_level_code(0), None);
    }

    #[test]
    fn signed_quantity_carries_side() {
        let mut position = Position::flat("BTC-PERPETUAL");
        position.quantity = 30.0;
        assert_eq!(position.signed_quantity(), 30.0);
        position.side = Side::Sell;
        assert_eq!(position.signed_quantity(), -30.0);
    }
}
