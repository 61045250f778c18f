//! Robust Soliton degree distribution for the LT code.

use crate::lcg::JavaRandom;

const C: f64 = 0.1;
const DELTA: f64 = 0.5;

/// Precomputed CDF over block degrees `1..=K`.
#[derive(Debug, Clone)]
pub struct SolitonDistribution {
    cdf: Vec<f64>,
}

impl SolitonDistribution {
    pub fn new(k: usize) -> Self {
        if k == 0 {
            return Self { cdf: vec![1.0] };
        }

        let kf = k as f64;
        let r = C * (kf / DELTA).ln() * kf.sqrt();
        let spike = if r > 0.0 { (kf / r).floor() as usize } else { 0 };

        let mut mu = Vec::with_capacity(k);
        for d in 1..=k {
            let df = d as f64;
            let rho = if d == 1 { 1.0 / kf } else { 1.0 / (df * (df - 1.0)) };
            let tau = if spike >= 1 && d < spike {
                r / (df * kf)
            } else if d == spike {
                r * (r / DELTA).ln() / kf
            } else {
                0.0
            };
            mu.push(rho + tau);
        }

        let total: f64 = mu.iter().sum();
        let mut cdf = Vec::with_capacity(k);
        let mut acc = 0.0;
        for m in &mu {
            acc += m / total;
            cdf.push(acc);
        }
        // Guard the tail against accumulated rounding.
        if let Some(last) = cdf.last_mut() {
            *last = 1.0;
        }

        Self { cdf }
    }

    /// Draw a degree in `1..=K`; consumes exactly one `next_double()`.
    pub fn sample(&self, rng: &mut JavaRandom) -> usize {
        let u = rng.next_double();
        for (i, bound) in self.cdf.iter().enumerate() {
            if u <= *bound {
                return i + 1;
            }
        }
        self.cdf.len()
    }
}
