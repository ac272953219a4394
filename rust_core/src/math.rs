use std::f64::consts::PI;

pub const TWO_PI: f64 = 2.0 * PI;

/// Map an angle onto `[0, 2π)`.
#[inline]
pub fn wrap_two_pi(x: f64) -> f64 {
    let r = x.rem_euclid(TWO_PI);
    // rem_euclid can round up to exactly 2π for tiny negative inputs
    if r >= TWO_PI {
        0.0
    } else {
        r
    }
}

/// Stable `log(Σ exp(x_i))`. Returns `-inf` for an empty or all `-inf` slice.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// `log(I0(x))` for the modified Bessel function of the first kind, order 0.
///
/// Polynomial approximations from Abramowitz & Stegun 9.8.1 / 9.8.2; the large
/// argument branch is evaluated in log space so it never overflows.
pub fn log_i0(x: f64) -> f64 {
    let ax = x.abs();
    if ax <= 3.75 {
        let t = (ax / 3.75).powi(2);
        let v = 1.0
            + t * (3.5156229
                + t * (3.0899424
                    + t * (1.2067492 + t * (0.2659732 + t * (0.0360768 + t * 0.0045813)))));
        v.ln()
    } else {
        let t = 3.75 / ax;
        let poly = 0.39894228
            + t * (0.01328592
                + t * (0.00225319
                    + t * (-0.00157565
                        + t * (0.00916281
                            + t * (-0.02057706
                                + t * (0.02635537 + t * (-0.01647633 + t * 0.00392377)))))));
        ax - 0.5 * ax.ln() + poly.ln()
    }
}
