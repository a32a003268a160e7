// ===============================
// src/portfolio.rs
// ===============================
//
// Positions held by the strategy and the discovery of the three
// instruments it trades: the straddle call, the straddle put, and the
// future (or perpetual) used for hedging.

use ahash::AHashMap as HashMap;
use thiserror::Error;
use tracing::info;

use crate::domain::{double_equals, Instrument, OptionKind, Position};

/// One held instrument: the exchange-reported position plus the static
/// instrument definition attached from the security list.
#[derive(Debug, Clone)]
pub struct PositionEntry {
    pub position: Position,
    pub instrument: Instrument,
}

/// The three instruments the strategy operates on.
#[derive(Debug, Clone)]
pub struct StraddleInstruments {
    pub call: Instrument,
    pub put: Instrument,
    pub future: Instrument,
}

#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("there is no instrument information for position {0}")]
    UnknownPositionSymbol(String),
    #[error("impossible to determine the straddle from the current positions")]
    IncompleteStraddle,
    #[error("straddle legs {0} and {1} are not allowed to be together")]
    MismatchedStraddle(String, String),
    #[error("impossible to find a future or the perpetual ({0})")]
    NoHedgeInstrument(String),
    #[error("hedge instrument {0} has no contract multiplier")]
    MissingContractMultiplier(String),
}

#[derive(Debug, Default)]
pub struct Portfolio {
    entries: HashMap<String, PositionEntry>,
}

impl Portfolio {
    /// Replaces all held positions with a fresh report from the exchange.
    /// Zero-quantity lines are dropped: flat means absent.
    pub fn rebuild(&mut self, positions: Vec<Position>) {
        self.entries.clear();
        for position in positions {
            if double_equals(position.quantity, 0.0) {
                continue;
            }
            let instrument = placeholder_instrument(&position.symbol);
            self.entries.insert(position.symbol.clone(), PositionEntry { position, instrument });
        }
    }

    /// Attaches instrument definitions to the held positions and works out
    /// the straddle legs and the hedge instrument.
    ///
    /// The hedge future may not be part of the positions; in that case it is
    /// searched in the instrument list, first by the dated-future symbol
    /// prefix of the call, then as `<currency>-PERPETUAL`, and a flat
    /// position is created for it.
    pub fn attach_instruments(
        &mut self,
        instruments: &[Instrument],
    ) -> Result<StraddleInstruments, PortfolioError> {
        let mut call: Option<Instrument> = None;
        let mut put: Option<Instrument> = None;
        let mut future: Option<Instrument> = None;

        for entry in self.entries.values_mut() {
            let symbol = &entry.position.symbol;
            let instrument = instruments
                .iter()
                .find(|instrument| &instrument.symbol == symbol)
                .ok_or_else(|| PortfolioError::UnknownPositionSymbol(symbol.clone()))?;
            entry.instrument = instrument.clone();

            if instrument.security_type == "OPT" {
                match instrument.put_call {
                    Some(OptionKind::Call) => call = Some(instrument.clone()),
                    _ => put = Some(instrument.clone()),
                }
            } else {
                future = Some(instrument.clone());
            }
        }

        let (call, put) = match (call, put) {
            (Some(call), Some(put)) => (call, put),
            _ => return Err(PortfolioError::IncompleteStraddle),
        };

        if call.main_currency != put.main_currency
            || call.maturity_date != put.maturity_date
            || call.strike_price != put.strike_price
        {
            return Err(PortfolioError::MismatchedStraddle(call.symbol, put.symbol));
        }

        let future = match future {
            Some(future) => future,
            None => {
                let discovered = discover_hedge_instrument(&call.symbol, instruments)?;
                info!(symbol = %discovered.symbol, "hedge instrument discovered, creating flat position");
                self.entries.insert(
                    discovered.symbol.clone(),
                    PositionEntry {
                        position: Position::flat(&discovered.symbol),
                        instrument: discovered.clone(),
                    },
                );
                discovered
            }
        };

        if future.contract_multiplier.is_none() {
            return Err(PortfolioError::MissingContractMultiplier(future.symbol));
        }

        Ok(StraddleInstruments { call, put, future })
    }

    pub fn get(&self, symbol: &str) -> Option<&PositionEntry> {
        self.entries.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut PositionEntry> {
        self.entries.get_mut(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.entries.contains_key(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PositionEntry> {
        self.entries.values()
    }

    /// Signed quantity held in a symbol; flat when unknown.
    pub fn signed_quantity(&self, symbol: &str) -> f64 {
        self.entries.get(symbol).map_or(0.0, |entry| entry.position.signed_quantity())
    }

    /// Contract multiplier attached to a held symbol; zero when unknown.
    pub fn contract_multiplier(&self, symbol: &str) -> f64 {
        self.entries
            .get(symbol)
            .and_then(|entry| entry.instrument.contract_multiplier)
            .unwrap_or(0.0)
    }
}

/// Looks for the hedge instrument in the full instrument list: a dated
/// future shares the first 11 characters of the option symbol
/// ("BTC-27JUN25"); failing that, the perpetual for the same currency.
fn discover_hedge_instrument(
    call_symbol: &str,
    instruments: &[Instrument],
) -> Result<Instrument, PortfolioError> {
    let future_symbol: String = call_symbol.chars().take(11).collect();
    if let Some(instrument) = instruments.iter().find(|i| i.symbol == future_symbol) {
        return Ok(instrument.clone());
    }

    let perpetual_symbol = format!("{}-PERPETUAL", &future_symbol.chars().take(3).collect::<String>());
    instruments
        .iter()
        .find(|i| i.symbol == perpetual_symbol)
        .cloned()
        .ok_or(PortfolioError::NoHedgeInstrument(perpetual_symbol))
}

fn placeholder_instrument(symbol: &str) -> Instrument {
    Instrument {
        symbol: symbol.to_string(),
        description: String::new(),
        security_type: String::new(),
        main_currency: String::new(),
        contract_multiplier: None,
        put_call: None,
        strike_price: None,
        strike_currency: None,
        maturity_date: None,
        min_trade_volume: None,
        tick_size: None,
        bbo: None,
    }
}
