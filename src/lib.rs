//! Delta-hedging (gamma scalping) agent for a single option straddle
//! against a linear hedge instrument on one exchange.
//!
//! The strategy keeps the portfolio's aggregate delta near zero: every
//! top-of-book change re-prices the straddle (generalized Black-Scholes
//! with an implied-volatility solve), and the resulting correction is
//! worked as a single good-till-cancel order on the future. Unpaired
//! hedge fills are stacked in a persistent levels book that pins the
//! price and size of later hedges and realizes PnL whenever a buy meets
//! a sell.

pub mod config;
pub mod domain;
pub mod gateway;
pub mod levels;
pub mod metrics;
pub mod portfolio;
pub mod pricing;
pub mod recorder;
pub mod strategy;
pub mod testing;
pub mod transport;
