// ===============================
// src/testing.rs (manual strategy)
// ===============================
//
// Interactive menu for poking the transport by hand: request data, fire a
// probe order, cancel it, and watch the raw events come back. Default
// strategy when none is selected on the command line.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::domain::Side;
use crate::transport::{Transport, TransportEvent};

const TEST_SYMBOL: &str = "BTC-PERPETUAL";

const MENU: &str = "\
###########################################
# Menu:                                   #
#     1 - Request instrument list         #
#     2 - Request market data             #
#     3 - Request positions list          #
#     4 - Send probe order                #
#     5 <id> - Cancel order               #
#     6 - Mass cancellation order         #
#     7 - Mass status request             #
#-----------------------------------------#
#     0 - Quit                            #
###########################################";

pub async fn run<T: Transport>(mut transport: T, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    println!("Running testing strategy...");
    println!("{MENU}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            maybe_line = lines.next_line() => {
                let line = match maybe_line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                if !dispatch(line.trim(), &mut transport) {
                    transport.stop();
                    break;
                }
                println!("{MENU}");
            }
            maybe_event = events.recv() => {
                match maybe_event {
                    Some(TransportEvent::Logout) => {
                        info!("session logged out");
                        break;
                    }
                    Some(event) => info!(?event, "event"),
                    None => break,
                }
            }
        }
    }
}

/// Returns false when the user asked to quit.
fn dispatch<T: Transport>(line: &str, transport: &mut T) -> bool {
    let mut parts = line.split_whitespace();
    let choice = parts.next().unwrap_or("");
    match choice {
        "0" => return false,
        "1" => transport.request_instrument_list(),
        "2" => transport.request_market_data(TEST_SYMBOL),
        "3" => transport.request_positions(),
        "4" => {
            let id = transport.send_gtc_order(TEST_SYMBOL, Side::Sell, 3999.0, 10.0);
            info!(%id, "probe order sent");
        }
        "5" => match parts.next() {
            Some(order_id) => transport.send_cancel_order(order_id),
            None => warn!("usage: 5 <order id>"),
        },
        "6" => transport.send_mass_cancellation_order(),
        "7" => transport.request_mass_status(),
        other => println!("Option {other} is not available"),
    }
    true
}
