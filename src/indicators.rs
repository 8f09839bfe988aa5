// =============================================================================
// Technical Indicators — pure functions feeding the quantitative filter
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the market-state
// node computes per symbol. Every function returns `Option<T>` or an empty
// series so callers are forced to handle insufficient data and numerical
// edge cases.
//
// EMA / RSI / ROC operate on close series; ATR / ADX need full bars.
// Smoothed indicators use Wilder's method throughout.
// =============================================================================

use crate::types::Ohlcv;

// ---------------------------------------------------------------------------
// EMA
// ---------------------------------------------------------------------------

/// Exponential moving average series for `closes` with look-back `period`.
/// Seeded with the SMA of the first `period` values; one output element per
/// close starting at index `period - 1`.
pub fn ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let sma: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &close in &closes[period..] {
        let value = close * multiplier + prev * (1.0 - multiplier);
        if !value.is_finite() {
            // A broken series is worse than a short one.
            break;
        }
        result.push(value);
        prev = value;
    }
    result
}

// ---------------------------------------------------------------------------
// RSI (Wilder)
// ---------------------------------------------------------------------------

/// Most recent RSI value for `closes` with look-back `period`.
///
/// avg_gain/avg_loss are seeded with the SMA of the first `period` deltas,
/// then smoothed with Wilder's method. A zero average loss clamps to 100.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let (gain, loss) = if delta > 0.0 {
            (delta, 0.0)
        } else {
            (0.0, delta.abs())
        };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    let value = 100.0 - 100.0 / (1.0 + rs);
    value.is_finite().then_some(value)
}

// ---------------------------------------------------------------------------
// ROC
// ---------------------------------------------------------------------------

/// Most recent rate of change: percentage move over the last `period` bars.
pub fn roc(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() <= period {
        return None;
    }
    let prev = closes[closes.len() - 1 - period];
    if prev == 0.0 {
        return Some(0.0);
    }
    let value = (closes[closes.len() - 1] - prev) / prev * 100.0;
    value.is_finite().then_some(value)
}

// ---------------------------------------------------------------------------
// ATR (Wilder)
// ---------------------------------------------------------------------------

/// Most recent average true range over `period` bars.
///
/// TR = max(H - L, |H - prevClose|, |L - prevClose|); ATR is Wilder-smoothed
/// TR seeded with the SMA of the first `period` TR values.
pub fn atr(bars: &[Ohlcv], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let hl = w[1].high - w[1].low;
            let hc = (w[1].high - w[0].close).abs();
            let lc = (w[1].low - w[0].close).abs();
            hl.max(hc).max(lc)
        })
        .collect();

    let period_f = period as f64;
    let mut value: f64 = true_ranges[..period].iter().sum::<f64>() / period_f;
    for &tr in &true_ranges[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }
    value.is_finite().then_some(value)
}

// ---------------------------------------------------------------------------
// ADX (Wilder)
// ---------------------------------------------------------------------------

/// Most recent ADX over `period` bars. Needs at least `2 * period + 1` bars:
/// `period` transitions to seed the directional smoothing and another
/// `period` DX values to seed the ADX average.
pub fn adx(bars: &[Ohlcv], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < 2 * period + 1 {
        return None;
    }
    let period_f = period as f64;

    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);
    let mut tr_vals = Vec::with_capacity(bars.len() - 1);

    for w in bars.windows(2) {
        let up = w[1].high - w[0].high;
        let down = w[0].low - w[1].low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });

        let hl = w[1].high - w[1].low;
        let hc = (w[1].high - w[0].close).abs();
        let lc = (w[1].low - w[0].close).abs();
        tr_vals.push(hl.max(hc).max(lc));
    }

    // Wilder running sums, seeded with the first `period` raw values.
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr_vals[..period].iter().sum();

    let dx_at = |sm_plus: f64, sm_minus: f64, sm_tr: f64| -> Option<f64> {
        if sm_tr == 0.0 {
            return Some(0.0);
        }
        let plus_di = sm_plus / sm_tr * 100.0;
        let minus_di = sm_minus / sm_tr * 100.0;
        let denom = plus_di + minus_di;
        if denom == 0.0 {
            return Some(0.0);
        }
        let dx = (plus_di - minus_di).abs() / denom * 100.0;
        dx.is_finite().then_some(dx)
    };

    let mut dx_series = vec![dx_at(sm_plus, sm_minus, sm_tr)?];
    for i in period..tr_vals.len() {
        sm_plus = sm_plus - sm_plus / period_f + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period_f + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period_f + tr_vals[i];
        dx_series.push(dx_at(sm_plus, sm_minus, sm_tr)?);
    }

    if dx_series.len() < period {
        return None;
    }
    let mut adx_value: f64 = dx_series[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_series[period..] {
        adx_value = (adx_value * (period_f - 1.0) + dx) / period_f;
    }
    adx_value.is_finite().then_some(adx_value)
}

// ---------------------------------------------------------------------------
// Convenience
// ---------------------------------------------------------------------------

/// Close series of a bar slice.
pub fn closes(bars: &[Ohlcv]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Average volume over the most recent `period` bars.
pub fn average_volume(bars: &[Ohlcv], period: usize) -> Option<f64> {
    if period == 0 || bars.is_empty() {
        return None;
    }
    let take = period.min(bars.len());
    let sum: f64 = bars[bars.len() - take..].iter().map(|b| b.volume).sum();
    Some(sum / take as f64)
}
