// ===============================
// src/strategy.rs (gamma scalper)
// ===============================
//
// The hedging decision engine. One task consumes the transport's event
// channel serially and owns every piece of strategy state: the positions,
// the three instruments, the levels book and the single working hedge
// order. Startup walks logon -> positions -> instruments -> open-order
// recovery -> market-data warmup; every top-of-book change afterwards
// re-evaluates the portfolio delta and places, cancels or keeps the hedge.

use ahash::AHashSet as HashSet;
use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::domain::{
    Bbo, ExecutionReport, Instrument, MarketSide, MarketUpdate, OptionKind, OrderStatus, Position,
    Side, WorkingOrder,
};
use crate::levels::Levels;
use crate::metrics::{
    CANCELS, CORRECTIONS, DELTA, DELTA_TOTAL, EVALUATIONS, EVALUATIONS_SKIPPED, EXECS, ORDERS,
    TICKS, TICKS_BY_SYMBOL,
};
use crate::portfolio::{Portfolio, StraddleInstruments};
use crate::transport::{Transport, TransportEvent};

/// Fatal strategy failure: an exchange-side invariant did not hold. The
/// session cannot continue safely and the process is expected to exit.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ScalperError {
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitLogon,
    AwaitPositions,
    AwaitInstruments,
    AwaitMassStatus,
    /// Recovering open orders: this many execution reports still to come.
    AwaitOpenOrders(i32),
    Warmup,
    Steady,
}

/// Strategy parameters read from the user configuration file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub aux_folder: std::path::PathBuf,
    pub price_sweetener: f64,
    pub interest_rate: f64,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            aux_folder: config.require("AuxFolder")?.into(),
            price_sweetener: config.require_f64("PriceSweetener")?,
            interest_rate: config.require_f64("InterestRate")?,
        })
    }
}

pub struct GammaScalper<T: Transport> {
    transport: T,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    interest_rate: f64,

    phase: Phase,
    portfolio: Portfolio,
    instruments: Option<StraddleInstruments>,
    levels: Levels,

    /// Symbols that have delivered their first book snapshot.
    snapshots: HashSet<String>,

    // Cash deltas from the last successful evaluation.
    delta_future: f64,
    delta_call: f64,
    delta_put: f64,

    order: Option<WorkingOrder>,
}

impl<T: Transport> GammaScalper<T> {
    pub fn new(settings: &Settings, transport: T, events: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self {
            transport,
            events,
            interest_rate: settings.interest_rate,
            phase: Phase::AwaitLogon,
            portfolio: Portfolio::default(),
            instruments: None,
            levels: Levels::open(&settings.aux_folder, settings.price_sweetener),
            snapshots: HashSet::new(),
            delta_future: 0.0,
            delta_call: 0.0,
            delta_put: 0.0,
            order: None,
        }
    }

    /// Consumes transport events until logout (Ok) or a fatal error (Err).
    pub async fn run(mut self) -> Result<(), ScalperError> {
        info!("running gamma scalper strategy");
        while let Some(event) = self.events.recv().await {
            match event {
                TransportEvent::Logon => self.on_logon(),
                TransportEvent::Logout => {
                    self.on_logout();
                    return Ok(());
                }
                TransportEvent::MassStatusReport(count) => self.on_mass_status_report(count)?,
                TransportEvent::Positions(positions) => self.on_positions(positions)?,
                TransportEvent::Instruments(instruments) => self.on_instruments(instruments)?,
                TransportEvent::Execution(report) => self.on_execution_report(report)?,
                TransportEvent::Market(update) => self.on_market_update(update)?,
                TransportEvent::CancelReject(reject) => {
                    warn!(order_id = %reject.order_id, text = ?reject.text, "cancel rejected");
                }
                TransportEvent::MassCancelReport(report) => {
                    info!(accepted = report.accepted, "mass cancel report");
                }
                TransportEvent::TextReject(text) => warn!(%text, "session level reject"),
            }
        }
        info!("transport channel closed");
        Ok(())
    }

    fn on_logon(&mut self) {
        info!("logged on, requesting positions");
        self.transport.request_positions();
        self.phase = Phase::AwaitPositions;
    }

    fn on_logout(&mut self) {
        info!("logged out");
        self.cancel_all_orders();
        self.phase = Phase::AwaitLogon;
    }

    fn on_positions(&mut self, positions: Option<Vec<Position>>) -> Result<(), ScalperError> {
        let positions = match positions {
            Some(positions) => positions,
            None => return Err(self.report_error("no positions retrieved, stopping strategy")),
        };

        self.portfolio.rebuild(positions);
        self.transport.request_instrument_list();
        self.phase = Phase::AwaitInstruments;
        Ok(())
    }

    fn on_instruments(&mut self, instruments: Option<Vec<Instrument>>) -> Result<(), ScalperError> {
        let instruments = match instruments {
            Some(instruments) => instruments,
            None => return Err(self.report_error("no instruments were retrieved, stopping strategy")),
        };

        let resolved = match self.portfolio.attach_instruments(&instruments) {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.report_error(&e.to_string())),
        };

        info!(
            call = %resolved.call.symbol,
            put = %resolved.put.symbol,
            future = %resolved.future.symbol,
            "instruments resolved"
        );
        self.instruments = Some(resolved);

        // There could be orders hanging from a previous run.
        self.transport.request_mass_status();
        self.phase = Phase::AwaitMassStatus;
        Ok(())
    }

    fn on_mass_status_report(&mut self, report_number: i32) -> Result<(), ScalperError> {
        if report_number > 1 {
            return Err(self.report_error(&format!(
                "expecting at most 1 open order, the mass status reports {report_number}"
            )));
        }

        if report_number == 0 {
            self.subscribe_market_data();
            self.phase = Phase::Warmup;
        } else {
            self.phase = Phase::AwaitOpenOrders(report_number);
        }
        Ok(())
    }

    fn on_execution_report(&mut self, report: ExecutionReport) -> Result<(), ScalperError> {
        // Reports answering the mass status request recover the working order.
        if let Phase::AwaitOpenOrders(pending) = self.phase {
            self.order = Some(self.recovered_order(&report)?);

            let pending = pending - 1;
            self.phase = Phase::AwaitOpenOrders(pending);
            if pending == 0 {
                self.subscribe_market_data();
                self.phase = Phase::Warmup;
            }
            return Ok(());
        }

        if report.symbol.is_none() {
            return Ok(());
        }

        let status = match report.order_status {
            Some(status) => status,
            None => return Ok(()),
        };
        EXECS.with_label_values(&[status_label(status)]).inc();

        let matches_working_order = self.order.as_ref().map_or(false, |order| {
            report.order_id.as_deref() == Some(order.id.as_str())
                || report.original_order_id.as_deref() == Some(order.original_id.as_str())
        });

        if matches_working_order {
            match status {
                OrderStatus::Filled => {
                    let incremental = self.take_incremental_fill(&report);
                    self.update_position(&report, incremental);
                    self.order = None;
                }
                OrderStatus::Canceled | OrderStatus::Rejected => {
                    self.order = None;
                }
                OrderStatus::Partial => {
                    if let (Some(order), Some(new_id)) = (self.order.as_mut(), report.order_id.clone()) {
                        // The exchange may rotate client ids between reports.
                        order.id = new_id;
                    }
                    let incremental = self.take_incremental_fill(&report);
                    self.update_position(&report, incremental);
                }
                OrderStatus::New => {
                    if let (Some(order), Some(new_id)) = (self.order.as_mut(), report.order_id.clone()) {
                        order.id = new_id;
                    }
                }
            }
        } else {
            // Not an order of this strategy (e.g. a manual trade on the same
            // account); only the position is affected.
            match status {
                OrderStatus::Filled | OrderStatus::Partial => {
                    let incremental = report.executed_volume.unwrap_or(0.0);
                    self.update_position(&report, incremental);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn on_market_update(&mut self, update: MarketUpdate) -> Result<(), ScalperError> {
        self.on_market_update_at(update, Utc::now().date_naive())
    }

    fn on_market_update_at(&mut self, update: MarketUpdate, today: NaiveDate) -> Result<(), ScalperError> {
        // Top-of-book subscriptions deliver one bid and one ask at most.
        if update.updates.len() > 2 {
            return Err(self.report_error("received a bbo with more than two legs"));
        }

        let mut bbo = Bbo::default();
        for level in &update.updates {
            match level.side {
                MarketSide::Bid => {
                    bbo.bid = Some(level.price);
                    bbo.bid_volume = Some(level.volume);
                }
                MarketSide::Ask => {
                    bbo.ask = Some(level.price);
                    bbo.ask_volume = Some(level.volume);
                }
            }
        }

        let Some(instruments) = self.instruments.as_mut() else {
            return Ok(());
        };
        if update.symbol == instruments.future.symbol {
            instruments.future.bbo = Some(bbo);
        } else if update.symbol == instruments.call.symbol {
            instruments.call.bbo = Some(bbo);
        } else if update.symbol == instruments.put.symbol {
            instruments.put.bbo = Some(bbo);
        } else {
            // Not for the straddle nor the hedge instrument.
            return Ok(());
        }

        TICKS.inc();
        TICKS_BY_SYMBOL.with_label_values(&[&update.symbol]).inc();

        match self.phase {
            Phase::Warmup => {
                self.snapshots.insert(update.symbol);
                if self.snapshots.len() < 3 {
                    return Ok(());
                }
                info!("all snapshots received, strategy is live");
                self.phase = Phase::Steady;
                self.evaluate_at(today)
            }
            Phase::Steady => self.evaluate_at(today),
            _ => Ok(()),
        }
    }

    fn subscribe_market_data(&mut self) {
        let Some(instruments) = &self.instruments else { return };
        let symbols = [
            instruments.future.symbol.clone(),
            instruments.call.symbol.clone(),
            instruments.put.symbol.clone(),
        ];
        for symbol in symbols {
            self.transport.request_market_data(&symbol);
        }
    }

    fn recovered_order(&self, report: &ExecutionReport) -> Result<WorkingOrder, ScalperError> {
        let missing = |name: &str| ScalperError {
            message: format!("open order recovery report is missing {name}"),
        };
        Ok(WorkingOrder {
            id: report.order_id.clone().ok_or_else(|| missing("order id"))?,
            original_id: report.original_order_id.clone().ok_or_else(|| missing("original order id"))?,
            side: report.side.ok_or_else(|| missing("side"))?,
            order_price: report.order_price.ok_or_else(|| missing("order price"))?,
            full_volume: report.executed_volume.ok_or_else(|| missing("executed volume"))?,
            open_volume: report.open_volume.ok_or_else(|| missing("open volume"))?,
        })
    }

    /// Folds the report's cumulative executed volume into the working order
    /// and returns the fresh incremental fill.
    fn take_incremental_fill(&mut self, report: &ExecutionReport) -> f64 {
        let order = match self.order.as_mut() {
            Some(order) => order,
            None => return report.executed_volume.unwrap_or(0.0),
        };
        let cumulative = report.executed_volume.unwrap_or(order.full_volume);
        let incremental = cumulative - order.full_volume;
        order.full_volume = cumulative;
        incremental
    }

    /// Applies a fill to the held position and the levels book.
    fn update_position(&mut self, report: &ExecutionReport, incremental_volume: f64) {
        let (Some(symbol), Some(side), Some(average_price), Some(_)) = (
            report.symbol.as_ref(),
            report.side,
            report.average_execution_price,
            report.executed_volume,
        ) else {
            return;
        };
        if !self.portfolio.contains(symbol) {
            return;
        }

        let underlying_mid = self
            .instruments
            .as_ref()
            .and_then(|instruments| instruments.future.bbo)
            .and_then(|bbo| bbo.mid());

        if let Some(entry) = self.portfolio.get_mut(symbol) {
            let signed = entry.position.signed_quantity() + incremental_volume * side.sign();
            entry.position.quantity = signed.abs();
            entry.position.side = if signed >= 0.0 { Side::Buy } else { Side::Sell };
            entry.position.settlement_price = average_price;
            entry.position.underlying_end_price = underlying_mid.unwrap_or(0.0);
            info!(
                %symbol,
                quantity = entry.position.quantity,
                side = %entry.position.side,
                "position updated"
            );
        }

        let multiplier = self
            .instruments
            .as_ref()
            .and_then(|instruments| instruments.future.contract_multiplier)
            .unwrap_or(1.0);
        self.levels.update_levels(incremental_volume, average_price, side, multiplier);
    }

    fn evaluate_at(&mut self, today: NaiveDate) -> Result<(), ScalperError> {
        EVALUATIONS.inc();

        let maturity = self.instruments.as_ref().and_then(|i| i.call.maturity_date);
        let maturity = match maturity {
            Some(maturity) => maturity,
            None => {
                self.skip("missing maturity date");
                return Ok(());
            }
        };

        let time_to_expiration = (maturity - today).num_days() as f64 / 360.0;
        if time_to_expiration < 0.0 {
            return Err(self.report_error("straddle maturity was reached, stopping strategy"));
        }

        if let Some(reason) = self.update_deltas(time_to_expiration) {
            self.skip(reason);
            return Ok(());
        }

        let Some(instruments) = &self.instruments else { return Ok(()) };
        let future_symbol = instruments.future.symbol.clone();
        let future_bbo = match instruments.future.bbo {
            Some(bbo) => bbo,
            None => return Ok(()),
        };
        let Some(underlying_price) = future_bbo.mid() else { return Ok(()) };
        let Some(multiplier) = instruments.future.contract_multiplier else { return Ok(()) };

        let total_delta = self.delta_put + self.delta_call + self.delta_future;
        let delta_per_future = multiplier / underlying_price;
        let raw_corrections = (total_delta / delta_per_future).round();
        let corrections_todo = (raw_corrections / multiplier).floor() * multiplier;

        DELTA_TOTAL.set(total_delta);
        CORRECTIONS.set(corrections_todo);
        debug!(
            future_delta = self.delta_future,
            call_delta = self.delta_call,
            put_delta = self.delta_put,
            total_delta,
            delta_per_future,
            corrections_todo,
            "evaluated"
        );

        if corrections_todo == 0.0 {
            return Ok(());
        }

        // Buy the hedge to offset short delta, sell to offset long delta.
        let side = if corrections_todo < 0.0 { Side::Buy } else { Side::Sell };

        // At most one order may be working. Same side: leave it and let the
        // reports catch up. Opposite side: cancel it and wait for the next
        // tick before placing anything new.
        if let Some(order) = &self.order {
            if order.side != side {
                let order_id = order.id.clone();
                info!(%order_id, "canceling previous order");
                CANCELS.inc();
                self.transport.send_cancel_order(&order_id);
            }
            return Ok(());
        }

        let Some(price_to_use) = self.levels.price_to_use(side, &future_bbo, multiplier) else {
            return Ok(());
        };
        let volume_to_use = self.levels.volume_to_use(side, corrections_todo.abs());

        info!(
            %side,
            price = price_to_use,
            volume = volume_to_use,
            symbol = %future_symbol,
            "sending hedge order"
        );
        ORDERS.with_label_values(&[side_label(side)]).inc();
        let order_id = self.transport.send_gtc_order(&future_symbol, side, price_to_use, volume_to_use);
        self.order = Some(WorkingOrder {
            id: String::new(),
            original_id: order_id,
            side,
            order_price: price_to_use,
            full_volume: 0.0,
            open_volume: volume_to_use,
        });
        Ok(())
    }

    /// Refreshes the three cash deltas from the current books. Returns the
    /// reason when this cycle has to be skipped.
    fn update_deltas(&mut self, time_to_expiration: f64) -> Option<&'static str> {
        let Some(instruments) = &self.instruments else {
            return Some("missing instruments");
        };

        let underlying_price = instruments.future.bbo.and_then(|bbo| bbo.mid());
        let Some(underlying_price) = underlying_price else {
            return Some("missing underlying price");
        };

        let Some(strike) = instruments.call.strike_price else {
            return Some("missing strike price");
        };

        let cost_of_carry = self.interest_rate;

        // Mid prices, reconstructing a missing leg through put-call parity.
        let call_price = call_price_with_parity(
            &instruments.call.bbo,
            &instruments.put.bbo,
            underlying_price,
            time_to_expiration,
            strike,
            self.interest_rate,
        );
        let put_price = put_price_with_parity(
            &instruments.call.bbo,
            &instruments.put.bbo,
            underlying_price,
            time_to_expiration,
            strike,
            self.interest_rate,
        );
        let (Some(call_price), Some(put_price)) = (call_price, put_price) else {
            return Some("missing prices");
        };
        // Parity reconstruction can land slightly below zero.
        let call_price = call_price.max(0.0);
        let put_price = put_price.max(0.0);

        let mut call_delta = option_delta(
            OptionKind::Call,
            underlying_price,
            strike,
            self.interest_rate,
            time_to_expiration,
            cost_of_carry,
            call_price,
        );
        let mut put_delta = option_delta(
            OptionKind::Put,
            underlying_price,
            strike,
            self.interest_rate,
            time_to_expiration,
            cost_of_carry,
            put_price,
        )
        // Put deltas are negative by convention.
        .map(|delta| -delta);

        if call_delta.is_none() && put_delta.is_none() {
            return Some("missing both deltas");
        }

        // Deduce one delta from the other (dC - dP = 1) when one leg's
        // implied volatility could not be solved, clamping the present value
        // to its physical half-space first.
        match (call_delta, put_delta) {
            (None, Some(put)) => {
                let put = put.min(0.0);
                put_delta = Some(put);
                call_delta = Some(1.0 + put);
            }
            (Some(call), None) => {
                let call = call.max(0.0);
                call_delta = Some(call);
                put_delta = Some(1.0 - call);
            }
            _ => {}
        }
        let (Some(call_delta), Some(put_delta)) = (call_delta, put_delta) else {
            return Some("missing both deltas");
        };

        if call_delta.is_nan() || put_delta.is_nan() {
            return Some("some delta is NaN");
        }

        let future_symbol = instruments.future.symbol.clone();
        let call_symbol = instruments.call.symbol.clone();
        let put_symbol = instruments.put.symbol.clone();

        self.delta_future = (self.portfolio.signed_quantity(&future_symbol)
            * self.portfolio.contract_multiplier(&future_symbol))
            / underlying_price;
        self.delta_call = call_delta
            * self.portfolio.signed_quantity(&call_symbol)
            * self.portfolio.contract_multiplier(&call_symbol);
        self.delta_put = put_delta
            * self.portfolio.signed_quantity(&put_symbol)
            * self.portfolio.contract_multiplier(&put_symbol);

        DELTA.with_label_values(&["future"]).set(self.delta_future);
        DELTA.with_label_values(&["call"]).set(self.delta_call);
        DELTA.with_label_values(&["put"]).set(self.delta_put);

        debug!(underlying_price, call_price, put_price, call_delta, put_delta, "prices refreshed");
        None
    }

    fn cancel_all_orders(&mut self) {
        if self.order.is_none() {
            return;
        }
        self.transport.send_mass_cancellation_order();
        self.order = None;
    }

    fn skip(&self, reason: &'static str) {
        debug!(reason, "skipping evaluation");
        EVALUATIONS_SKIPPED.with_label_values(&[reason]).inc();
    }

    fn report_error(&self, message: &str) -> ScalperError {
        self.print_report();
        error!("{message}");
        ScalperError { message: message.to_string() }
    }

    fn print_report(&self) {
        info!("############### positions #################");
        for entry in self.portfolio.iter() {
            info!(
                symbol = %entry.position.symbol,
                quantity = entry.position.quantity,
                side = %entry.position.side,
                settlement_price = entry.position.settlement_price,
                "position"
            );
        }
        if let Some(instruments) = &self.instruments {
            info!(
                call = %instruments.call.symbol,
                put = %instruments.put.symbol,
                future = %instruments.future.symbol,
                strike = ?instruments.call.strike_price,
                "instruments in use"
            );
            for (name, instrument) in [
                ("future", &instruments.future),
                ("call", &instruments.call),
                ("put", &instruments.put),
            ] {
                if let Some(bbo) = &instrument.bbo {
                    info!(
                        leg = name,
                        symbol = %instrument.symbol,
                        bid = ?bbo.bid,
                        ask = ?bbo.ask,
                        "bbo"
                    );
                }
            }
        }
        match &self.order {
            Some(order) => info!(%order, "active order"),
            None => info!("no active order"),
        }
        info!(
            future = self.delta_future,
            call = self.delta_call,
            put = self.delta_put,
            "deltas"
        );
        info!("###########################################");
    }
}

/// Mid of the call leg; reconstructed from the put through put-call parity
/// (C = P + S - K e^{-rT}, all in cash) when the call book is unusable.
/// Prices stay in fraction-of-underlying terms.
fn call_price_with_parity(
    call_bbo: &Option<Bbo>,
    put_bbo: &Option<Bbo>,
    underlying_price: f64,
    time_to_expiration: f64,
    strike: f64,
    interest_rate: f64,
) -> Option<f64> {
    if let Some(mid) = call_bbo.and_then(|bbo| bbo.mid()) {
        return Some(mid);
    }
    let put_mid = put_bbo.and_then(|bbo| bbo.mid())?;

    let s = underlying_price;
    let p = put_mid * s;
    let k = strike * (-interest_rate * time_to_expiration).exp();
    Some((p + s - k) / s)
}

/// Mid of the put leg; reconstructed from the call (P = C - S + K e^{-rT}).
fn put_price_with_parity(
    call_bbo: &Option<Bbo>,
    put_bbo: &Option<Bbo>,
    underlying_price: f64,
    time_to_expiration: f64,
    strike: f64,
    interest_rate: f64,
) -> Option<f64> {
    if let Some(mid) = put_bbo.and_then(|bbo| bbo.mid()) {
        return Some(mid);
    }
    let call_mid = call_bbo.and_then(|bbo| bbo.mid())?;

    let s = underlying_price;
    let c = call_mid * s;
    let k = strike * (-interest_rate * time_to_expiration).exp();
    Some((c - s + k) / s)
}

/// Delta of one leg from its quote-space price: convert to cash, solve the
/// implied volatility, then differentiate. Absent when the solve fails.
fn option_delta(
    kind: OptionKind,
    underlying_price: f64,
    strike: f64,
    interest_rate: f64,
    time_to_expiration: f64,
    cost_of_carry: f64,
    raw_option_price: f64,
) -> Option<f64> {
    let option_price = raw_option_price * underlying_price;
    let implied_volatility = crate::pricing::implied_volatility(
        kind,
        underlying_price,
        strike,
        interest_rate,
        time_to_expiration,
        cost_of_carry,
        option_price,
    )?;
    Some(crate::pricing::delta(
        kind,
        underlying_price,
        strike,
        interest_rate,
        time_to_expiration,
        cost_of_carry,
        implied_volatility,
    ))
}

fn status_label(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::New => "new",
        OrderStatus::Partial => "partial",
        OrderStatus::Filled => "filled",
        OrderStatus::Canceled => "canceled",
        OrderStatus::Rejected => "rejected",
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MarketAction, MarketUpdateLevel};
    use crate::pricing;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    const STRIKE: f64 = 3500.0;
    const MULTIPLIER: f64 = 10.0;
    const CALL: &str = "BTC-27JUN25-3500-C";
    const PUT: &str = "BTC-27JUN25-3500-P";
    const FUTURE: &str = "BTC-PERPETUAL";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 28).unwrap()
    }

    fn maturity() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 27).unwrap() // 30 days out
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Positions,
        Instruments,
        MassStatus,
        MarketData(String),
        Gtc { symbol: String, side: Side, price: f64, volume: f64 },
        Cancel(String),
        MassCancel,
    }

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Sent>>>,
        next_id: Arc<Mutex<u64>>,
    }

    impl RecordingTransport {
        fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    impl Transport for RecordingTransport {
        fn request_positions(&mut self) {
            self.sent.lock().unwrap().push(Sent::Positions);
        }
        fn request_instrument_list(&mut self) {
            self.sent.lock().unwrap().push(Sent::Instruments);
        }
        fn request_mass_status(&mut self) {
            self.sent.lock().unwrap().push(Sent::MassStatus);
        }
        fn request_market_data(&mut self, symbol: &str) {
            self.sent.lock().unwrap().push(Sent::MarketData(symbol.to_string()));
        }
        fn send_gtc_order(&mut self, symbol: &str, side: Side, price: f64, volume: f64) -> String {
            self.sent.lock().unwrap().push(Sent::Gtc {
                symbol: symbol.to_string(),
                side,
                price,
                volume,
            });
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            format!("T-{next}")
        }
        fn send_cancel_order(&mut self, order_id: &str) {
            self.sent.lock().unwrap().push(Sent::Cancel(order_id.to_string()));
        }
        fn send_mass_cancellation_order(&mut self) {
            self.sent.lock().unwrap().push(Sent::MassCancel);
        }
        fn stop(&mut self) {}
    }

    struct Harness {
        scalper: GammaScalper<RecordingTransport>,
        transport: RecordingTransport,
        _aux: TempDir,
    }

    fn option_instrument(symbol: &str, kind: OptionKind) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            description: format!("{symbol} option"),
            security_type: "OPT".to_string(),
            main_currency: "BTC".to_string(),
            contract_multiplier: Some(1.0),
            put_call: Some(kind),
            strike_price: Some(STRIKE),
            strike_currency: Some("USD".to_string()),
            maturity_date: Some(maturity()),
            min_trade_volume: Some(0.1),
            tick_size: Some(0.0005),
            bbo: None,
        }
    }

    fn future_instrument() -> Instrument {
        Instrument {
            symbol: FUTURE.to_string(),
            description: "BTC perpetual".to_string(),
            security_type: "PERP".to_string(),
            main_currency: "BTC".to_string(),
            contract_multiplier: Some(MULTIPLIER),
            put_call: None,
            strike_price: None,
            strike_currency: None,
            maturity_date: None,
            min_trade_volume: Some(MULTIPLIER),
            tick_size: Some(0.5),
            bbo: None,
        }
    }

    fn long_position(symbol: &str, quantity: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity,
            side: Side::Buy,
            settlement_price: 0.0,
            underlying_end_price: 0.0,
        }
    }

    fn market_update(symbol: &str, bid: f64, ask: f64) -> MarketUpdate {
        MarketUpdate {
            symbol: symbol.to_string(),
            updates: vec![
                MarketUpdateLevel {
                    action: MarketAction::New,
                    side: MarketSide::Bid,
                    price: bid,
                    volume: 1000.0,
                },
                MarketUpdateLevel {
                    action: MarketAction::New,
                    side: MarketSide::Ask,
                    price: ask,
                    volume: 1000.0,
                },
            ],
        }
    }

    /// Market update whose snapshot carries no levels at all: the symbol has
    /// been seen but its book is empty.
    fn empty_market_update(symbol: &str) -> MarketUpdate {
        MarketUpdate { symbol: symbol.to_string(), updates: vec![] }
    }

    /// Native (fraction-of-underlying) straddle quotes at a flat volatility.
    fn native_mid(kind: OptionKind, underlying: f64, volatility: f64) -> f64 {
        pricing::black_scholes_price(kind, underlying, STRIKE, 0.0, 30.0 / 360.0, 0.0, volatility)
            / underlying
    }

    fn harness() -> Harness {
        let aux = TempDir::new().unwrap();
        let settings = Settings {
            aux_folder: aux.path().to_path_buf(),
            price_sweetener: 0.0001,
            interest_rate: 0.0,
        };
        let transport = RecordingTransport::default();
        let (_event_tx, event_rx) = mpsc::unbounded_channel();
        let scalper = GammaScalper::new(&settings, transport.clone(), event_rx);
        Harness { scalper, transport, _aux: aux }
    }

    /// Runs the startup sequence up to a completed warmup on a delta-neutral
    /// market (tiny premium at the strike rounds the correction to zero) and
    /// returns with the transport command log cleared.
    fn warmed_up(harness: &mut Harness) {
        let scalper = &mut harness.scalper;
        scalper.on_logon();
        scalper
            .on_positions(Some(vec![long_position(CALL, 1.0), long_position(PUT, 1.0)]))
            .unwrap();
        scalper
            .on_instruments(Some(vec![
                option_instrument(CALL, OptionKind::Call),
                option_instrument(PUT, OptionKind::Put),
                future_instrument(),
            ]))
            .unwrap();
        scalper.on_mass_status_report(0).unwrap();

        let call_mid = native_mid(OptionKind::Call, STRIKE, 0.025);
        let put_mid = native_mid(OptionKind::Put, STRIKE, 0.025);
        for update in [
            market_update(FUTURE, STRIKE - 1.0, STRIKE + 1.0),
            market_update(CALL, call_mid - 0.001, call_mid + 0.001),
            market_update(PUT, put_mid - 0.001, put_mid + 0.001),
        ] {
            apply_update(harness, update);
        }

        assert!(harness.scalper.order.is_none(), "warmup market must be neutral");
        harness.transport.take();
    }

    /// Jumps the whole market to a coherent state at the given underlying
    /// and flat volatility: the option books are replaced in place, then a
    /// single future tick triggers one evaluation against the fresh set.
    fn feed_quotes(harness: &mut Harness, underlying: f64, volatility: f64) {
        let call_mid = native_mid(OptionKind::Call, underlying, volatility);
        let put_mid = native_mid(OptionKind::Put, underlying, volatility);
        {
            let instruments = harness.scalper.instruments.as_mut().unwrap();
            instruments.call.bbo = Some(Bbo {
                bid: Some(call_mid - 0.001),
                ask: Some(call_mid + 0.001),
                bid_volume: Some(1000.0),
                ask_volume: Some(1000.0),
            });
            instruments.put.bbo = Some(Bbo {
                bid: Some(put_mid - 0.001),
                ask: Some(put_mid + 0.001),
                bid_volume: Some(1000.0),
                ask_volume: Some(1000.0),
            });
        }
        apply_update(harness, market_update(FUTURE, underlying - 1.0, underlying + 1.0));
    }

    /// on_market_update, but evaluation pinned to the fixed test date.
    fn apply_update(harness: &mut Harness, update: MarketUpdate) {
        harness.scalper.on_market_update_at(update, today()).unwrap();
    }

    #[test]
    fn settings_come_from_the_config_file() {
        let config = Config::from_pairs(&[
            ("AuxFolder", "/tmp/aux/"),
            ("PriceSweetener", "0.0001"),
            ("InterestRate", "0.01"),
        ]);
        let settings = Settings::from_config(&config).unwrap();
        assert_eq!(settings.aux_folder, std::path::PathBuf::from("/tmp/aux/"));
        assert_eq!(settings.price_sweetener, 0.0001);
        assert_eq!(settings.interest_rate, 0.01);

        let incomplete = Config::from_pairs(&[("AuxFolder", "/tmp/aux/")]);
        assert!(Settings::from_config(&incomplete).is_err());
    }

    #[test]
    fn startup_walks_the_request_chain() {
        let mut harness = harness();
        let scalper = &mut harness.scalper;

        scalper.on_logon();
        assert_eq!(harness.transport.take(), vec![Sent::Positions]);

        harness
            .scalper
            .on_positions(Some(vec![long_position(CALL, 1.0), long_position(PUT, 1.0)]))
            .unwrap();
        assert_eq!(harness.transport.take(), vec![Sent::Instruments]);

        harness
            .scalper
            .on_instruments(Some(vec![
                option_instrument(CALL, OptionKind::Call),
                option_instrument(PUT, OptionKind::Put),
                future_instrument(),
            ]))
            .unwrap();
        assert_eq!(harness.transport.take(), vec![Sent::MassStatus]);

        harness.scalper.on_mass_status_report(0).unwrap();
        assert_eq!(
            harness.transport.take(),
            vec![
                Sent::MarketData(FUTURE.to_string()),
                Sent::MarketData(CALL.to_string()),
                Sent::MarketData(PUT.to_string()),
            ]
        );
        assert_eq!(harness.scalper.phase, Phase::Warmup);
    }

    #[test]
    fn missing_positions_report_is_fatal() {
        let mut harness = harness();
        harness.scalper.on_logon();
        assert!(harness.scalper.on_positions(None).is_err());
    }

    #[test]
    fn two_open_orders_at_mass_status_is_fatal() {
        let mut harness = harness();
        warmed_up(&mut harness);
        assert!(harness.scalper.on_mass_status_report(2).is_err());
    }

    #[test]
    fn no_order_before_warmup_completes() {
        let mut harness = harness();
        let scalper = &mut harness.scalper;
        scalper.on_logon();
        scalper
            .on_positions(Some(vec![long_position(CALL, 1.0), long_position(PUT, 1.0)]))
            .unwrap();
        scalper
            .on_instruments(Some(vec![
                option_instrument(CALL, OptionKind::Call),
                option_instrument(PUT, OptionKind::Put),
                future_instrument(),
            ]))
            .unwrap();
        scalper.on_mass_status_report(0).unwrap();
        harness.transport.take();

        // Strongly unbalanced market on only two of the three symbols.
        let call_mid = native_mid(OptionKind::Call, 3800.0, 0.6);
        apply_update(&mut harness, market_update(FUTURE, 3799.0, 3801.0));
        apply_update(&mut harness, market_update(CALL, call_mid - 0.001, call_mid + 0.001));
        apply_update(&mut harness, market_update(FUTURE, 3799.0, 3801.0));

        assert_eq!(harness.transport.take(), vec![]);
        assert_eq!(harness.scalper.phase, Phase::Warmup);

        let put_mid = native_mid(OptionKind::Put, 3800.0, 0.6);
        apply_update(&mut harness, market_update(PUT, put_mid - 0.001, put_mid + 0.001));
        assert_eq!(harness.scalper.phase, Phase::Steady);
    }

    #[test]
    fn balanced_straddle_needs_no_hedge() {
        let mut harness = harness();
        // Tiny premium: deltas come out at +/- one half and the rounded
        // correction collapses to zero.
        warmed_up(&mut harness);

        feed_quotes(&mut harness, STRIKE, 0.025);
        assert_eq!(harness.transport.take(), vec![]);
        assert!(harness.scalper.order.is_none());
    }

    #[test]
    fn rally_sells_the_future_at_the_ask() {
        let mut harness = harness();
        warmed_up(&mut harness);

        feed_quotes(&mut harness, 3600.0, 0.6);
        let sent = harness.transport.take();

        // Net option delta at 3600 with 60 vol works out to ~0.196 in cash;
        // divided by delta-per-future (10/3600) and floored to a whole
        // multiple of the contract size that is a 70-lot sale.
        let gtc: Vec<_> = sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Gtc { symbol, side, price, volume } => Some((symbol.clone(), *side, *price, *volume)),
                _ => None,
            })
            .collect();
        assert_eq!(gtc.len(), 1);
        let (symbol, side, price, volume) = &gtc[0];
        assert_eq!(symbol, FUTURE);
        assert_eq!(*side, Side::Sell);
        assert_eq!(*price, 3601.0); // levels empty: far touch
        assert_eq!(*volume, 70.0);

        let order = harness.scalper.order.as_ref().expect("working order recorded");
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.original_id, "T-1");
        assert_eq!(order.open_volume, 70.0);
        assert_eq!(order.full_volume, 0.0);
    }

    #[test]
    fn sell_off_buys_the_future_rounding_away_from_zero() {
        let mut harness = harness();
        warmed_up(&mut harness);

        feed_quotes(&mut harness, 3400.0, 0.6);
        let sent = harness.transport.take();

        // Net option delta at 3400 with 60 vol is ~-0.064 in cash, a raw
        // correction of -22 contracts. Flooring to a whole multiple of the
        // contract size makes that a 30-lot buy, priced at the bid since
        // the levels stack is empty.
        let gtc: Vec<_> = sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Gtc { symbol, side, price, volume } => Some((symbol.clone(), *side, *price, *volume)),
                _ => None,
            })
            .collect();
        assert_eq!(gtc.len(), 1);
        let (symbol, side, price, volume) = &gtc[0];
        assert_eq!(symbol, FUTURE);
        assert_eq!(*side, Side::Buy);
        assert_eq!(*price, 3399.0);
        assert_eq!(*volume, 30.0);
    }

    #[test]
    fn same_side_decision_leaves_the_working_order_alone() {
        let mut harness = harness();
        warmed_up(&mut harness);

        feed_quotes(&mut harness, 3600.0, 0.6);
        harness.transport.take();

        // Still long delta: same side indicated, nothing new may be sent.
        feed_quotes(&mut harness, 3620.0, 0.6);
        assert_eq!(harness.transport.take(), vec![]);
        assert!(harness.scalper.order.is_some());
    }

    #[test]
    fn opposite_side_decision_cancels_first() {
        let mut harness = harness();
        warmed_up(&mut harness);

        feed_quotes(&mut harness, 3600.0, 0.6);
        harness.transport.take();

        // Exchange acknowledged the order under a rotated id.
        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("EX-9".to_string()),
                original_order_id: Some("T-1".to_string()),
                order_status: Some(OrderStatus::New),
                symbol: Some(FUTURE.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(harness.scalper.order.as_ref().unwrap().id, "EX-9");

        // Market collapses: a buy is now indicated against the working sell.
        feed_quotes(&mut harness, 3300.0, 0.6);
        let sent = harness.transport.take();
        assert_eq!(sent, vec![Sent::Cancel("EX-9".to_string())]);
        assert!(harness.scalper.order.is_some(), "order stays until the cancel report");

        // Next tick, still no new order before the report clears the slot.
        feed_quotes(&mut harness, 3300.0, 0.6);
        assert_eq!(harness.transport.take(), vec![Sent::Cancel("EX-9".to_string())]);

        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("EX-9".to_string()),
                original_order_id: Some("T-1".to_string()),
                order_status: Some(OrderStatus::Canceled),
                symbol: Some(FUTURE.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(harness.scalper.order.is_none());
    }

    #[test]
    fn fill_updates_position_and_levels_then_flip_pairs_back() {
        let mut harness = harness();
        warmed_up(&mut harness);

        feed_quotes(&mut harness, 3600.0, 0.6);
        harness.transport.take();

        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("EX-1".to_string()),
                original_order_id: Some("T-1".to_string()),
                order_status: Some(OrderStatus::Filled),
                side: Some(Side::Sell),
                symbol: Some(FUTURE.to_string()),
                executed_volume: Some(70.0),
                open_volume: Some(0.0),
                average_execution_price: Some(3601.0),
                ..Default::default()
            })
            .unwrap();

        assert!(harness.scalper.order.is_none());
        assert_eq!(harness.scalper.portfolio.signed_quantity(FUTURE), -70.0);
        assert_eq!(harness.scalper.levels.len(), 1);
        let front = harness.scalper.levels.front().unwrap();
        assert_eq!(front.side, Side::Sell);
        assert_eq!(front.volume, 70.0);
        assert_eq!(front.price, 3601.0);

        // Collapse: short future and short-delta options indicate a buy. The
        // buy is capped by the front level volume and priced no worse than
        // the stored sale minus the sweetener margin.
        feed_quotes(&mut harness, 3400.0, 0.6);
        let sent = harness.transport.take();
        let gtc: Vec<_> = sent
            .iter()
            .filter_map(|sent| match sent {
                Sent::Gtc { side, price, volume, .. } => Some((*side, *price, *volume)),
                _ => None,
            })
            .collect();
        assert_eq!(gtc.len(), 1);
        let (side, price, volume) = gtc[0];
        assert_eq!(side, Side::Buy);
        assert_eq!(price, 3399.0); // bid is below the level reference
        assert_eq!(volume, 70.0); // min(corrections, front volume)

        // The buy-back fill empties the book and realizes the round trip.
        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("EX-2".to_string()),
                original_order_id: Some("T-2".to_string()),
                order_status: Some(OrderStatus::Filled),
                side: Some(Side::Buy),
                symbol: Some(FUTURE.to_string()),
                executed_volume: Some(70.0),
                open_volume: Some(0.0),
                average_execution_price: Some(3399.0),
                ..Default::default()
            })
            .unwrap();

        assert!(harness.scalper.levels.is_empty());
        assert_eq!(harness.scalper.portfolio.signed_quantity(FUTURE), 0.0);
        let expected_pnl = 70.0 * MULTIPLIER * (1.0 / 3399.0 - 1.0 / 3601.0);
        assert!((harness.scalper.levels.realized_pnl() - expected_pnl).abs() < 1e-9);
    }

    #[test]
    fn partial_fill_keeps_the_order_and_tracks_cumulative_volume() {
        let mut harness = harness();
        warmed_up(&mut harness);

        feed_quotes(&mut harness, 3600.0, 0.6);
        harness.transport.take();

        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("EX-1".to_string()),
                original_order_id: Some("T-1".to_string()),
                order_status: Some(OrderStatus::Partial),
                side: Some(Side::Sell),
                symbol: Some(FUTURE.to_string()),
                executed_volume: Some(30.0),
                open_volume: Some(40.0),
                average_execution_price: Some(3601.0),
                ..Default::default()
            })
            .unwrap();

        let order = harness.scalper.order.as_ref().expect("partial keeps the order");
        assert_eq!(order.id, "EX-1");
        assert_eq!(order.full_volume, 30.0);
        assert_eq!(harness.scalper.portfolio.signed_quantity(FUTURE), -30.0);

        // The final report carries the full cumulative; only the fresh 40
        // lots reach the position and the levels book.
        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("EX-1".to_string()),
                original_order_id: Some("T-1".to_string()),
                order_status: Some(OrderStatus::Filled),
                side: Some(Side::Sell),
                symbol: Some(FUTURE.to_string()),
                executed_volume: Some(70.0),
                open_volume: Some(0.0),
                average_execution_price: Some(3601.0),
                ..Default::default()
            })
            .unwrap();

        assert!(harness.scalper.order.is_none());
        assert_eq!(harness.scalper.portfolio.signed_quantity(FUTURE), -70.0);
        // Both fills landed on the same (sell) side of the book.
        assert_eq!(harness.scalper.levels.len(), 2);
        let front = harness.scalper.levels.front().unwrap();
        assert_eq!(front.volume, 40.0);
    }

    #[test]
    fn unrelated_fills_update_the_position_only() {
        let mut harness = harness();
        warmed_up(&mut harness);

        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("MANUAL-1".to_string()),
                original_order_id: Some("MANUAL-1".to_string()),
                order_status: Some(OrderStatus::Filled),
                side: Some(Side::Buy),
                symbol: Some(FUTURE.to_string()),
                executed_volume: Some(20.0),
                open_volume: Some(0.0),
                average_execution_price: Some(3500.0),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(harness.scalper.portfolio.signed_quantity(FUTURE), 20.0);
        assert!(harness.scalper.order.is_none());
    }

    #[test]
    fn open_order_recovery_materializes_the_working_order() {
        let mut harness = harness();
        let scalper = &mut harness.scalper;
        scalper.on_logon();
        scalper
            .on_positions(Some(vec![long_position(CALL, 1.0), long_position(PUT, 1.0)]))
            .unwrap();
        scalper
            .on_instruments(Some(vec![
                option_instrument(CALL, OptionKind::Call),
                option_instrument(PUT, OptionKind::Put),
                future_instrument(),
            ]))
            .unwrap();
        scalper.on_mass_status_report(1).unwrap();
        assert_eq!(scalper.phase, Phase::AwaitOpenOrders(1));
        harness.transport.take();

        harness
            .scalper
            .on_execution_report(ExecutionReport {
                order_id: Some("EX-OLD".to_string()),
                original_order_id: Some("T-OLD".to_string()),
                order_status: Some(OrderStatus::New),
                side: Some(Side::Sell),
                symbol: Some(FUTURE.to_string()),
                order_price: Some(3605.0),
                executed_volume: Some(10.0),
                open_volume: Some(60.0),
                ..Default::default()
            })
            .unwrap();

        let order = harness.scalper.order.as_ref().expect("order recovered");
        assert_eq!(order.id, "EX-OLD");
        assert_eq!(order.original_id, "T-OLD");
        assert_eq!(order.full_volume, 10.0);
        assert_eq!(order.open_volume, 60.0);
        assert_eq!(harness.scalper.phase, Phase::Warmup);
        assert_eq!(
            harness.transport.take(),
            vec![
                Sent::MarketData(FUTURE.to_string()),
                Sent::MarketData(CALL.to_string()),
                Sent::MarketData(PUT.to_string()),
            ]
        );
    }

    #[test]
    fn missing_call_market_falls_back_to_parity() {
        let mut harness = harness();
        warmed_up(&mut harness);

        // Underlying and put quoted; call snapshot arrives with an empty
        // book. Scenario: put mid 0.10 at the strike reconstructs a call mid
        // of 0.10 through parity and the evaluation proceeds.
        apply_update(&mut harness, market_update(FUTURE, 3499.0, 3501.0));
        apply_update(&mut harness, market_update(PUT, 0.099, 0.101));
        apply_update(&mut harness, empty_market_update(CALL));

        assert!((harness.scalper.delta_call - 0.55).abs() < 0.01);
        assert!((harness.scalper.delta_put + 0.45).abs() < 0.01);
    }

    #[test]
    fn missing_underlying_market_skips_the_cycle() {
        let mut harness = harness();
        warmed_up(&mut harness);
        harness.scalper.delta_call = 0.0;

        apply_update(&mut harness, empty_market_update(FUTURE));
        assert_eq!(harness.transport.take(), vec![]);
        // Deltas untouched by the skipped cycle.
        assert_eq!(harness.scalper.delta_call, 0.0);
    }

    #[test]
    fn maturity_reached_is_fatal() {
        let mut harness = harness();
        warmed_up(&mut harness);
        let result = harness.scalper.evaluate_at(maturity() + chrono::Duration::days(1));
        assert!(result.is_err());
    }

    #[test]
    fn oversized_market_update_is_fatal() {
        let mut harness = harness();
        warmed_up(&mut harness);

        let mut update = market_update(FUTURE, 3499.0, 3501.0);
        update.updates.push(MarketUpdateLevel {
            action: MarketAction::New,
            side: MarketSide::Bid,
            price: 3498.0,
            volume: 10.0,
        });
        assert!(harness.scalper.on_market_update(update).is_err());
    }

    #[test]
    fn logout_with_a_working_order_mass_cancels() {
        let mut harness = harness();
        warmed_up(&mut harness);

        feed_quotes(&mut harness, 3600.0, 0.6);
        harness.transport.take();
        assert!(harness.scalper.order.is_some());

        harness.scalper.on_logout();
        assert_eq!(harness.transport.take(), vec![Sent::MassCancel]);
        assert!(harness.scalper.order.is_none());
    }
}
