//! Fitzpatrick (1999) extinction law, normalized to `A_V = 1`.
//!
//! Ultraviolet wavelengths (below 2700 Å) use the analytic F99 form; optical
//! and infrared wavelengths use a natural cubic spline through the F99 anchor
//! points, the last two of which sit on the UV curve so the law is continuous.

use ndarray::Array1;

const UV_X0: f64 = 4.596;
const UV_GAMMA: f64 = 0.99;
const UV_C3: f64 = 3.23;
const UV_C4: f64 = 0.41;
const UV_C5: f64 = 5.9;

/// Inverse-micron boundary above which the UV form applies.
const UV_BOUNDARY: f64 = 1e4 / 2700.0;

fn uv_k(x: f64, r_v: f64) -> f64 {
    let c2 = -0.824 + 4.717 / r_v;
    let c1 = 2.030 - 3.007 * c2;
    let x2 = x * x;
    let drude = x2 / ((x2 - UV_X0 * UV_X0).powi(2) + x2 * UV_GAMMA * UV_GAMMA);
    let far_uv = if x >= UV_C5 {
        let y = x - UV_C5;
        0.5392 * y * y + 0.05644 * y * y * y
    } else {
        0.0
    };
    c1 + c2 * x + UV_C3 * drude + UV_C4 * far_uv
}

/// Natural cubic spline, with linear-segment extrapolation handled by the
/// outermost cubic pieces.
struct NaturalSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    second: Vec<f64>,
}

impl NaturalSpline {
    fn new(x: Vec<f64>, y: Vec<f64>) -> Self {
        let n = x.len();
        let mut second = vec![0.0; n];
        let mut u = vec![0.0; n];
        // Tridiagonal sweep with zero curvature at both ends.
        for i in 1..n - 1 {
            let sig = (x[i] - x[i - 1]) / (x[i + 1] - x[i - 1]);
            let p = sig * second[i - 1] + 2.0;
            second[i] = (sig - 1.0) / p;
            let slope_diff = (y[i + 1] - y[i]) / (x[i + 1] - x[i])
                - (y[i] - y[i - 1]) / (x[i] - x[i - 1]);
            u[i] = (6.0 * slope_diff / (x[i + 1] - x[i - 1]) - sig * u[i - 1]) / p;
        }
        second[n - 1] = 0.0;
        for k in (0..n - 1).rev() {
            second[k] = second[k] * second[k + 1] + u[k];
        }
        Self { x, y, second }
    }

    fn eval(&self, value: f64) -> f64 {
        let n = self.x.len();
        let hi = self
            .x
            .iter()
            .position(|&knot| knot > value)
            .unwrap_or(n - 1)
            .clamp(1, n - 1);
        let lo = hi - 1;
        let h = self.x[hi] - self.x[lo];
        let a = (self.x[hi] - value) / h;
        let b = (value - self.x[lo]) / h;
        a * self.y[lo]
            + b * self.y[hi]
            + ((a * a * a - a) * self.second[lo] + (b * b * b - b) * self.second[hi]) * h * h / 6.0
    }
}

fn optical_spline(r_v: f64) -> NaturalSpline {
    let x = vec![
        0.0,
        1e4 / 26500.0,
        1e4 / 12200.0,
        1e4 / 6000.0,
        1e4 / 5470.0,
        1e4 / 4670.0,
        1e4 / 4110.0,
        1e4 / 2700.0,
        1e4 / 2600.0,
    ];
    let r2 = r_v * r_v;
    let y = vec![
        -r_v,
        0.26469 * r_v / 3.1 - r_v,
        0.82925 * r_v / 3.1 - r_v,
        -0.422809 + 1.00270 * r_v + 2.13572e-4 * r2 - r_v,
        -5.13540e-2 + 1.00216 * r_v - 7.35778e-5 * r2 - r_v,
        7.00127e-1 + 1.00184 * r_v - 3.32598e-5 * r2 - r_v,
        1.19456 + 1.01707 * r_v - 5.46959e-3 * r2 + 7.97809e-4 * r2 * r_v
            - 4.45636e-5 * r2 * r2
            - r_v,
        uv_k(x[7], r_v),
        uv_k(x[8], r_v),
    ];
    NaturalSpline::new(x, y)
}

/// `A(λ)/A_V` on a wavelength grid in Ångström.
pub fn fitzpatrick99(wave: &Array1<f64>, r_v: f64) -> Array1<f64> {
    let spline = optical_spline(r_v);
    wave.mapv(|lambda| {
        let x = 1e4 / lambda;
        let k = if x >= UV_BOUNDARY {
            uv_k(x, r_v)
        } else {
            spline.eval(x)
        };
        1.0 + k / r_v
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn anchor_points_are_reproduced() {
        let r_v = 3.1;
        let law = fitzpatrick99(&array![5470.0, 12200.0], r_v);
        let k_v = -5.13540e-2 + 1.00216 * r_v - 7.35778e-5 * r_v * r_v - r_v;
        assert_abs_diff_eq!(law[0], 1.0 + k_v / r_v, epsilon = 1e-12);
        assert_abs_diff_eq!(law[1], 0.82925 / 3.1, epsilon = 1e-12);
    }

    #[test]
    fn extinction_decreases_through_the_optical() {
        let wave = Array1::linspace(3300.0, 8600.0, 60);
        let law = fitzpatrick99(&wave, 2.8);
        for pair in law.windows(2) {
            assert!(pair[1] < pair[0]);
        }
        assert!(law[0] > 1.3 && law[59] < 0.6);
    }

    #[test]
    fn continuous_across_the_uv_boundary() {
        let law = fitzpatrick99(&array![2700.0 - 1e-6, 2700.0 + 1e-6], 2.8);
        assert_abs_diff_eq!(law[0], law[1], epsilon = 1e-6);
    }
}
