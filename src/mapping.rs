//! Linear remapping of brightness values between numeric ranges.

/// Linearly map `value` from the input range `[a, b]` into the output range
/// `[c, d]`, rounding to the nearest integer and clamping into the output
/// range. A degenerate single-point input range (`a == b`) maps to `c`.
pub fn linear_map(value: i64, in_range: [i64; 2], out_range: [i64; 2]) -> i64 {
    let [in_lo, in_hi] = in_range;
    let [out_lo, out_hi] = out_range;

    let in_delta = in_hi - in_lo;
    if in_delta == 0 {
        return out_lo;
    }

    let position = (value - in_lo) as f64 / in_delta as f64;
    let mapped = out_lo as f64 + position * (out_hi - out_lo) as f64;

    (mapped.round() as i64).clamp(out_lo.min(out_hi), out_lo.max(out_hi))
}

/// Remap a 0-100 brightness percentage into a configured `[lo, hi]` window:
/// 0 maps to `lo`, 100 maps to `hi`, and the result stays within 0-100.
pub fn range_remap(percent: i64, range: [i64; 2]) -> i64 {
    let [lo, hi] = range;
    let mapped = lo as f64 + (hi - lo) as f64 * (percent as f64 / 100.0);
    (mapped.round() as i64).clamp(0, 100)
}

/// Convert the hub's native 0-255 brightness into a 0-100 percentage.
pub fn percent_from_native(raw: f64) -> i64 {
    ((raw / 255.0) * 100.0).clamp(0.0, 100.0).round() as i64
}
