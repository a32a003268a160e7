// ===============================
// src/pricing.rs
// ===============================
//
// Pure option pricing kernel: cumulative normal (Hart's rational
// approximation), generalized Black-Scholes-Merton with cost of carry,
// implied volatility by successive linear interpolation, and delta.
// Everything here works in cash terms; callers convert from quote space.

use crate::domain::OptionKind;

/// Cumulative standard normal distribution via Hart's approximation.
/// Absolute error is below 1e-7 over the whole real line.
pub fn cumulative_normal(x: f64) -> f64 {
    let y = x.abs();

    const A1: f64 = 0.0352624965998911;
    const A2: f64 = 0.700383064443688;
    const A3: f64 = 6.37396220353165;
    const A4: f64 = 33.912866078383;
    const A5: f64 = 112.079291497871;
    const A6: f64 = 221.213596169931;
    const A7: f64 = 220.206867912376;

    const B1: f64 = 0.0883883476483184;
    const B2: f64 = 1.75566716318264;
    const B3: f64 = 16.064177579207;
    const B4: f64 = 86.7807322029461;
    const B5: f64 = 296.564248779674;
    const B6: f64 = 637.333633378831;
    const B7: f64 = 793.826512519948;
    const B8: f64 = 440.413735824752;

    if y > 37.0 {
        return if x > 0.0 { 1.0 } else { 0.0 };
    }

    let exponential = (-(y * y) / 2.0).exp();

    let mut cnd = if y < 7.07106781186547 {
        let sum_a = (((((A1 * y + A2) * y + A3) * y + A4) * y + A5) * y + A6) * y + A7;
        let sum_b = ((((((B1 * y + B2) * y + B3) * y + B4) * y + B5) * y + B6) * y + B7) * y + B8;
        exponential * (sum_a / sum_b)
    } else {
        let sum_a = y + 1.0 / (y + 2.0 / (y + 3.0 / (y + 4.0 / (y + 0.65))));
        exponential / (sum_a * 2.506628274631)
    };

    if x > 0.0 {
        cnd = 1.0 - cnd;
    }

    cnd
}

fn d1(spot: f64, strike: f64, time_to_expiration: f64, cost_of_carry: f64, volatility: f64) -> f64 {
    ((spot / strike).ln() + (cost_of_carry + (volatility * volatility) / 2.0) * time_to_expiration)
        / (volatility * time_to_expiration.sqrt())
}

/// Option price under the generalized Black-Scholes-Merton model.
///
/// `cost_of_carry` generalizes the model: equal to the interest rate for a
/// non-dividend stock, zero for options on futures.
pub fn black_scholes_price(
    call_or_put: OptionKind,
    spot: f64,
    strike: f64,
    interest_rate: f64,
    time_to_expiration: f64,
    cost_of_carry: f64,
    volatility: f64,
) -> f64 {
    let d1 = d1(spot, strike, time_to_expiration, cost_of_carry, volatility);
    let d2 = d1 - volatility * time_to_expiration.sqrt();

    let carry_discount = ((cost_of_carry - interest_rate) * time_to_expiration).exp();
    let rate_discount = (-interest_rate * time_to_expiration).exp();

    match call_or_put {
        OptionKind::Call => {
            spot * carry_discount * cumulative_normal(d1) - strike * rate_discount * cumulative_normal(d2)
        }
        OptionKind::Put => {
            strike * rate_discount * cumulative_normal(-d2) - spot * carry_discount * cumulative_normal(-d1)
        }
    }
}

/// Implied volatility by successive linear interpolation over [0.05, 5.0].
///
/// Returns None when the solver does not converge within 100 iterations,
/// which also covers target prices outside the bracket.
pub fn implied_volatility(
    call_or_put: OptionKind,
    spot: f64,
    strike: f64,
    interest_rate: f64,
    time_to_expiration: f64,
    cost_of_carry: f64,
    option_market_price: f64,
) -> Option<f64> {
    const MAX_ITERATIONS: u32 = 100;
    const EPSILON: f64 = 0.000008;

    let mut volatility_low = 0.05;
    let mut volatility_high = 5.0;

    let price = |volatility: f64| {
        black_scholes_price(
            call_or_put,
            spot,
            strike,
            interest_rate,
            time_to_expiration,
            cost_of_carry,
            volatility,
        )
    };

    let mut price_low = price(volatility_low);
    let mut price_high = price(volatility_high);

    let interpolate = |low: f64, high: f64, price_low: f64, price_high: f64| {
        low + (option_market_price - price_low) * (high - low) / (price_high - price_low)
    };

    let mut volatility = interpolate(volatility_low, volatility_high, price_low, price_high);
    let mut price_at_volatility = price(volatility);

    let mut counter = 0;
    while (option_market_price - price_at_volatility).abs() > EPSILON {
        counter += 1;
        if counter == MAX_ITERATIONS {
            return None;
        }

        if price_at_volatility < option_market_price {
            volatility_low = volatility;
            price_low = price(volatility_low);
        } else {
            volatility_high = volatility;
            price_high = price(volatility_high);
        }

        volatility = interpolate(volatility_low, volatility_high, price_low, price_high);
        price_at_volatility = price(volatility);
    }

    Some(volatility)
}

/// Black-Scholes delta. Put deltas come out positive here; the caller
/// restores the standard negative sign convention.
pub fn delta(
    call_or_put: OptionKind,
    spot: f64,
    strike: f64,
    interest_rate: f64,
    time_to_expiration: f64,
    cost_of_carry: f64,
    volatility: f64,
) -> f64 {
    let mut d1 = d1(spot, strike, time_to_expiration, cost_of_carry, volatility);
    if call_or_put == OptionKind::Put {
        d1 = -d1;
    }
    ((cost_of_carry - interest_rate) * time_to_expiration).exp() * cumulative_normal(d1)
}
