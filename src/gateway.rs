// ===============================
// src/gateway.rs (paper venue)
// ===============================
//
// In-process venue implementing the Transport contract for dry runs and
// tests: it logs the session on, reports a synthetic straddle position,
// serves an instrument universe with the matching perpetual, streams a
// random-walk top-of-book for the three symbols, and acknowledges GTC
// orders before filling them at their limit price after a short delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};
use tracing::info;

use crate::domain::{
    Bbo, ExecutionReport, Instrument, MarketAction, MarketSide, MarketUpdate, MarketUpdateLevel,
    MassCancelReport, OptionKind, OrderStatus, OrderType, Position, Side,
};
use crate::pricing;
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub currency: String,
    pub strike: f64,
    pub days_to_expiry: i64,
    pub contract_multiplier: f64,
    /// Starting underlying price for the random walk.
    pub start_price: f64,
    /// Flat volatility used to quote the straddle legs.
    pub quote_volatility: f64,
    /// Half spread on the option quotes, in fraction-of-underlying terms.
    pub option_half_spread: f64,
    /// Half spread on the future quotes, in currency.
    pub future_half_spread: f64,
    pub straddle_quantity: f64,
    pub tick_interval: Duration,
    pub fill_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            currency: "BTC".to_string(),
            strike: 3500.0,
            days_to_expiry: 30,
            contract_multiplier: 10.0,
            start_price: 3500.0,
            quote_volatility: 0.6,
            option_half_spread: 0.001,
            future_half_spread: 0.5,
            straddle_quantity: 1.0,
            tick_interval: Duration::from_millis(250),
            fill_delay: Duration::from_millis(500),
        }
    }
}

enum Command {
    RequestPositions,
    RequestInstruments,
    RequestMassStatus,
    RequestMarketData(String),
    GtcOrder { id: String, symbol: String, side: Side, price: f64, volume: f64 },
    CancelOrder(String),
    MassCancel,
    Fill(String),
    Stop,
}

/// Handle implementing `Transport`; the venue itself runs as a task.
pub struct PaperGateway {
    commands: mpsc::UnboundedSender<Command>,
    next_order_id: Arc<AtomicU64>,
}

impl PaperGateway {
    pub fn spawn(config: GatewayConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let venue = Venue::new(config, command_tx.clone(), event_tx);
        tokio::spawn(venue.run(command_rx));

        let gateway = Self {
            commands: command_tx,
            next_order_id: Arc::new(AtomicU64::new(1)),
        };
        (gateway, event_rx)
    }

    fn send(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

impl Transport for PaperGateway {
    fn request_positions(&mut self) {
        self.send(Command::RequestPositions);
    }

    fn request_instrument_list(&mut self) {
        self.send(Command::RequestInstruments);
    }

    fn request_mass_status(&mut self) {
        self.send(Command::RequestMassStatus);
    }

    fn request_market_data(&mut self, symbol: &str) {
        self.send(Command::RequestMarketData(symbol.to_string()));
    }

    fn send_gtc_order(&mut self, symbol: &str, side: Side, price: f64, volume: f64) -> String {
        let id = format!("PAPER-{}", self.next_order_id.fetch_add(1, Ordering::Relaxed));
        self.send(Command::GtcOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            price,
            volume,
        });
        id
    }

    fn send_cancel_order(&mut self, order_id: &str) {
        self.send(Command::CancelOrder(order_id.to_string()));
    }

    fn send_mass_cancellation_order(&mut self) {
        self.send(Command::MassCancel);
    }

    fn stop(&mut self) {
        self.send(Command::Stop);
    }
}

struct OpenOrder {
    symbol: String,
    side: Side,
    price: f64,
    volume: f64,
}

struct Venue {
    config: GatewayConfig,
    maturity: NaiveDate,
    call_symbol: String,
    put_symbol: String,
    future_symbol: String,
    underlying: f64,
    subscriptions: Vec<String>,
    open_orders: HashMap<String, OpenOrder>,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl Venue {
    fn new(
        config: GatewayConfig,
        commands: mpsc::UnboundedSender<Command>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let maturity = Utc::now().date_naive() + ChronoDuration::days(config.days_to_expiry);
        let expiry_tag = maturity.format("%d%b%y").to_string().to_uppercase();
        let currency = config.currency.clone();
        let strike = config.strike;

        Self {
            call_symbol: format!("{currency}-{expiry_tag}-{strike:.0}-C"),
            put_symbol: format!("{currency}-{expiry_tag}-{strike:.0}-P"),
            future_symbol: format!("{currency}-PERPETUAL"),
            underlying: config.start_price,
            maturity,
            subscriptions: Vec::new(),
            open_orders: HashMap::new(),
            commands,
            events,
            config,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        info!(
            call = %self.call_symbol,
            put = %self.put_symbol,
            future = %self.future_symbol,
            "paper gateway session up"
        );
        self.emit(TransportEvent::Logon);

        let mut feed = interval(self.config.tick_interval);
        loop {
            tokio::select! {
                maybe_command = command_rx.recv() => {
                    match maybe_command {
                        Some(Command::Stop) | None => {
                            self.emit(TransportEvent::Logout);
                            return;
                        }
                        Some(command) => self.handle(command),
                    }
                }
                _ = feed.tick() => {
                    if self.events.is_closed() {
                        return;
                    }
                    self.publish_quotes();
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RequestPositions => {
                let quantity = self.config.straddle_quantity;
                let positions = vec![
                    straddle_position(&self.call_symbol, quantity),
                    straddle_position(&self.put_symbol, quantity),
                ];
                self.emit(TransportEvent::Positions(Some(positions)));
            }
            Command::RequestInstruments => {
                let instruments = vec![
                    self.option_instrument(OptionKind::Call),
                    self.option_instrument(OptionKind::Put),
                    self.future_instrument(),
                ];
                self.emit(TransportEvent::Instruments(Some(instruments)));
            }
            Command::RequestMassStatus => {
                self.emit(TransportEvent::MassStatusReport(self.open_orders.len() as i32));
            }
            Command::RequestMarketData(symbol) => {
                if !self.subscriptions.contains(&symbol) {
                    self.subscriptions.push(symbol);
                }
                self.publish_quotes();
            }
            Command::GtcOrder { id, symbol, side, price, volume } => {
                self.emit(TransportEvent::Execution(ExecutionReport {
                    order_id: Some(id.clone()),
                    original_order_id: Some(id.clone()),
                    order_status: Some(OrderStatus::New),
                    side: Some(side),
                    symbol: Some(symbol.clone()),
                    order_type: Some(OrderType::Limit),
                    order_price: Some(price),
                    order_volume: Some(volume),
                    executed_volume: Some(0.0),
                    open_volume: Some(volume),
                    average_execution_price: None,
                    ..Default::default()
                }));
                self.open_orders.insert(id.clone(), OpenOrder { symbol, side, price, volume });

                let commands = self.commands.clone();
                let delay = self.config.fill_delay;
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = commands.send(Command::Fill(id));
                });
            }
            Command::Fill(id) => {
                if let Some(order) = self.open_orders.remove(&id) {
                    self.emit(TransportEvent::Execution(filled_report(&id, &order)));
                }
            }
            Command::CancelOrder(id) => {
                if let Some(order) = self.open_orders.remove(&id) {
                    self.emit(TransportEvent::Execution(ExecutionReport {
                        order_id: Some(id.clone()),
                        original_order_id: Some(id),
                        order_status: Some(OrderStatus::Canceled),
                        side: Some(order.side),
                        symbol: Some(order.symbol),
                        order_type: Some(OrderType::Limit),
                        order_price: Some(order.price),
                        order_volume: Some(order.volume),
                        executed_volume: Some(0.0),
                        open_volume: Some(0.0),
                        ..Default::default()
                    }));
                }
            }
            Command::MassCancel => {
                let ids: Vec<String> = self.open_orders.keys().cloned().collect();
                for id in ids {
                    self.handle(Command::CancelOrder(id));
                }
                self.emit(TransportEvent::MassCancelReport(MassCancelReport {
                    order_id: "MASS-CANCEL".to_string(),
                    accepted: true,
                    reject_reason: None,
                }));
            }
            // Stop is intercepted by the run loop.
            Command::Stop => {}
        }
    }

    /// One random-walk step on the underlying, then fresh snapshots for
    /// every subscribed symbol.
    fn publish_quotes(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }

        let step = rand::thread_rng().gen_range(-2.0..=2.0);
        self.underlying = (self.underlying + step).max(self.config.strike * 0.5);

        let time_to_expiration = self.config.days_to_expiry as f64 / 360.0;
        for symbol in self.subscriptions.clone() {
            let bbo = if symbol == self.future_symbol {
                let half = self.config.future_half_spread;
                quote(self.underlying - half, self.underlying + half)
            } else {
                let kind = if symbol == self.call_symbol { OptionKind::Call } else { OptionKind::Put };
                let cash = pricing::black_scholes_price(
                    kind,
                    self.underlying,
                    self.config.strike,
                    0.0,
                    time_to_expiration,
                    0.0,
                    self.config.quote_volatility,
                );
                let mid = cash / self.underlying;
                let half = self.config.option_half_spread;
                quote((mid - half).max(0.0001), mid + half)
            };

            self.emit(TransportEvent::Market(MarketUpdate {
                symbol: symbol.clone(),
                updates: vec![
                    MarketUpdateLevel {
                        action: MarketAction::New,
                        side: MarketSide::Bid,
                        price: bbo.bid.unwrap_or(0.0),
                        volume: bbo.bid_volume.unwrap_or(0.0),
                    },
                    MarketUpdateLevel {
                        action: MarketAction::New,
                        side: MarketSide::Ask,
                        price: bbo.ask.unwrap_or(0.0),
                        volume: bbo.ask_volume.unwrap_or(0.0),
                    },
                ],
            }));
        }
    }

    fn option_instrument(&self, kind: OptionKind) -> Instrument {
        let symbol = match kind {
            OptionKind::Call => self.call_symbol.clone(),
            OptionKind::Put => self.put_symbol.clone(),
        };
        Instrument {
            description: format!("{symbol} option"),
            symbol,
            security_type: "OPT".to_string(),
            main_currency: self.config.currency.clone(),
            contract_multiplier: Some(1.0),
            put_call: Some(kind),
            strike_price: Some(self.config.strike),
            strike_currency: Some("USD".to_string()),
            maturity_date: Some(self.maturity),
            min_trade_volume: Some(0.1),
            tick_size: Some(0.0005),
            bbo: None,
        }
    }

    fn future_instrument(&self) -> Instrument {
        Instrument {
            symbol: self.future_symbol.clone(),
            description: format!("{} perpetual", self.config.currency),
            security_type: "PERP".to_string(),
            main_currency: self.config.currency.clone(),
            contract_multiplier: Some(self.config.contract_multiplier),
            put_call: None,
            strike_price: None,
            strike_currency: None,
            maturity_date: None,
            min_trade_volume: Some(self.config.contract_multiplier),
            tick_size: Some(0.5),
            bbo: None,
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

fn quote(bid: f64, ask: f64) -> Bbo {
    Bbo {
        bid: Some(bid),
        ask: Some(ask),
        bid_volume: Some(1000.0),
        ask_volume: Some(1000.0),
    }
}

fn straddle_position(symbol: &str, quantity: f64) -> Position {
    Position {
        symbol: symbol.to_string(),
        quantity,
        side: Side::Buy,
        settlement_price: 0.0,
        underlying_end_price: 0.0,
    }
}

fn filled_report(id: &str, order: &OpenOrder) -> ExecutionReport {
    ExecutionReport {
        order_id: Some(id.to_string()),
        original_order_id: Some(id.to_string()),
        order_status: Some(OrderStatus::Filled),
        side: Some(order.side),
        symbol: Some(order.symbol.clone()),
        order_type: Some(OrderType::Limit),
        order_price: Some(order.price),
        order_volume: Some(order.volume),
        executed_volume: Some(order.volume),
        open_volume: Some(0.0),
        average_execution_price: Some(order.price),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("gateway should answer promptly")
            .expect("gateway channel open")
    }

    #[tokio::test]
    async fn logs_on_and_reports_the_straddle() {
        let (mut gateway, mut events) = PaperGateway::spawn(GatewayConfig::default());

        assert_eq!(next_event(&mut events).await, TransportEvent::Logon);

        gateway.request_positions();
        match next_event(&mut events).await {
            TransportEvent::Positions(Some(positions)) => {
                assert_eq!(positions.len(), 2);
                assert!(positions.iter().all(|p| p.quantity == 1.0 && p.side == Side::Buy));
            }
            other => panic!("expected positions, got {other:?}"),
        }

        gateway.request_instrument_list();
        match next_event(&mut events).await {
            TransportEvent::Instruments(Some(instruments)) => {
                assert_eq!(instruments.len(), 3);
                assert!(instruments.iter().any(|i| i.symbol == "BTC-PERPETUAL"));
            }
            other => panic!("expected instruments, got {other:?}"),
        }

        gateway.request_mass_status();
        assert_eq!(next_event(&mut events).await, TransportEvent::MassStatusReport(0));
    }

    #[tokio::test]
    async fn gtc_orders_are_acknowledged_then_filled() {
        let config = GatewayConfig { fill_delay: Duration::from_millis(10), ..Default::default() };
        let (mut gateway, mut events) = PaperGateway::spawn(config);
        assert_eq!(next_event(&mut events).await, TransportEvent::Logon);

        let id = gateway.send_gtc_order("BTC-PERPETUAL", Side::Sell, 3600.0, 100.0);

        match next_event(&mut events).await {
            TransportEvent::Execution(report) => {
                assert_eq!(report.order_status, Some(OrderStatus::New));
                assert_eq!(report.order_id.as_deref(), Some(id.as_str()));
            }
            other => panic!("expected ack, got {other:?}"),
        }
        match next_event(&mut events).await {
            TransportEvent::Execution(report) => {
                assert_eq!(report.order_status, Some(OrderStatus::Filled));
                assert_eq!(report.executed_volume, Some(100.0));
                assert_eq!(report.average_execution_price, Some(3600.0));
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_before_fill_wins() {
        let config = GatewayConfig { fill_delay: Duration::from_secs(30), ..Default::default() };
        let (mut gateway, mut events) = PaperGateway::spawn(config);
        assert_eq!(next_event(&mut events).await, TransportEvent::Logon);

        let id = gateway.send_gtc_order("BTC-PERPETUAL", Side::Buy, 3400.0, 50.0);
        let _ack = next_event(&mut events).await;

        gateway.send_cancel_order(&id);
        match next_event(&mut events).await {
            TransportEvent::Execution(report) => {
                assert_eq!(report.order_status, Some(OrderStatus::Canceled));
                assert_eq!(report.original_order_id.as_deref(), Some(id.as_str()));
            }
            other => panic!("expected cancel, got {other:?}"),
        }
    }
}
