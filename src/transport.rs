// ===============================
// src/transport.rs
// ===============================
//
// Contract between the strategy and the exchange session. The session
// side (a FIX 4.4 initiator in production, the paper gateway in this
// repo) delivers every callback as a typed event on one channel; the
// strategy consumes that channel serially, so no locking is needed on
// its state. Outbound calls are non-blocking handoffs.

use serde::{Deserialize, Serialize};

use crate::domain::{
    CancelReject, ExecutionReport, Instrument, MarketUpdate, MassCancelReport, Position, Side,
};

/// Everything the session can tell the strategy, in wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportEvent {
    Logon,
    Logout,
    /// Number of open orders that will follow as execution reports.
    MassStatusReport(i32),
    Positions(Option<Vec<Position>>),
    Instruments(Option<Vec<Instrument>>),
    Execution(ExecutionReport),
    Market(MarketUpdate),
    CancelReject(CancelReject),
    MassCancelReport(MassCancelReport),
    TextReject(String),
}

/// Outbound side of the session.
///
/// `send_gtc_order` returns the client order id the order was sent with so
/// the caller can match later execution reports against it.
pub trait Transport: Send {
    fn request_positions(&mut self);
    fn request_instrument_list(&mut self);
    fn request_mass_status(&mut self);
    fn request_market_data(&mut self, symbol: &str);
    fn send_gtc_order(&mut self, symbol: &str, side: Side, price: f64, volume: f64) -> String;
    fn send_cancel_order(&mut self, order_id: &str);
    fn send_mass_cancellation_order(&mut self);
    fn stop(&mut self);
}
