/// Canonical realized-return formula, in percent:
/// `((exit - entry) / entry) * 100`.
///
/// Outcome recording, backtesting, and model evaluation all call this one
/// function; never inline a local copy.
pub fn return_pct(entry_price: f64, exit_price: f64) -> f64 {
    ((exit_price - entry_price) / entry_price) * 100.0
}

/// Signed per-trade return for a position: positive when the position made
/// money. `position_sign` is +1 long, -1 short, 0 flat.
pub fn position_return_pct(position_sign: f64, entry_price: f64, exit_price: f64) -> f64 {
    position_sign * return_pct(entry_price, exit_price)
}
