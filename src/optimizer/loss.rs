//! Generalized robust loss (Barron, "A General and Adaptive Robust Loss
//! Function", CVPR 2019).
//!
//! `alpha` selects the shape: 2 is the L2 loss, 1 pseudo-Huber, 0 Cauchy,
//! -2 Geman-McClure and very negative values the Welsch loss. `scale` is the
//! width of the quadratic bowl around zero.

/// Below this `alpha` the Welsch limit is used.
const WELSCH_ALPHA: f64 = -100.0;

/// Below this residual magnitude the loss is treated as quadratic.
const QUADRATIC_LIMIT: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustLoss {
    alpha: f64,
    scale: f64,
}

impl Default for RobustLoss {
    fn default() -> Self {
        Self::new(2.0, 1.0)
    }
}

impl RobustLoss {
    pub fn new(alpha: f64, scale: f64) -> Self {
        Self { alpha, scale }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// `rho(x)`, with `rho(x) ~ 0.5 (x / c)^2` around zero.
    pub fn rho(&self, x: f64) -> f64 {
        let scaled_squared = (x / self.scale).powi(2);
        let alpha = self.alpha;
        if alpha == 2.0 {
            0.5 * scaled_squared
        } else if alpha == 0.0 {
            (0.5 * scaled_squared).ln_1p()
        } else if alpha < WELSCH_ALPHA {
            1.0 - (-0.5 * scaled_squared).exp()
        } else {
            let abs_alpha_minus_two = (alpha - 2.0).abs();
            abs_alpha_minus_two / alpha * ((scaled_squared / abs_alpha_minus_two + 1.0).powf(alpha / 2.0) - 1.0)
        }
    }

    /// Reshape a residual so that `0.5 r'^2 == rho(r)`, keeping its sign.
    pub fn apply(&self, residual: f64) -> f64 {
        let magnitude = residual.abs();
        if magnitude < QUADRATIC_LIMIT {
            return residual / self.scale;
        }
        residual * (2.0 * self.rho(magnitude)).max(0.0).sqrt() / magnitude
    }
}
