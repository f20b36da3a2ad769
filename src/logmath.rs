//! Integer log-domain arithmetic.
//!
//! All scores in the decoder are `log_b x` for a base very close to 1
//! (1.0001 by default), rounded to `i32`. That gives fine enough resolution
//! for acoustic likelihoods while keeping score comparison and accumulation
//! to integer adds. Addition of probabilities becomes a table lookup:
//! `log(x + y) = log(x) + table[log(x) - log(y)]` for `x >= y`, where the
//! table holds `log_b(1 + b^-d)` and is only a couple hundred KB for the
//! default base.
//!
//! The table is immutable after construction and meant to be shared behind an
//! [`Arc`] by every component of a session (and across sessions).
use crate::error::{DecodeError, Result};
use std::sync::Arc;

/// Log-domain score. `WORST_SCORE` is the identity for max and an absorbing
/// floor for adds.
pub type Score = i32;

/// Worst representable score, with headroom so sums of a few of these don't
/// wrap around.
pub const WORST_SCORE: Score = i32::MIN >> 1;

#[derive(Debug)]
pub struct LogMath {
    base: f64,
    /// ln(base), cached for the conversions.
    ln_of_base: f64,
    /// `table[d] = round(log_b(1 + b^-d))`, up to the first zero entry.
    table: Vec<u16>,
}

impl LogMath {
    /// Build the add table for the given base. Bases very close to 1 give
    /// finer resolution and a larger table.
    pub fn new(base: f64) -> Result<Arc<Self>> {
        if !(base > 1.0) || !base.is_finite() {
            return Err(DecodeError::Config(format!(
                "log base must be a finite number > 1.0, got {base}"
            )));
        }
        let ln_of_base = base.ln();
        let mut table = Vec::new();
        let mut d = 0u32;
        loop {
            let v = ((1.0 + (-(d as f64) * ln_of_base).exp()).ln() / ln_of_base).round();
            if v < 1.0 {
                break;
            }
            table.push(v as u16);
            d += 1;
        }
        Ok(Arc::new(Self {
            base,
            ln_of_base,
            table,
        }))
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    /// Log-domain addition of probabilities: returns `log(b^a + b^b)`.
    pub fn add(&self, a: Score, b: Score) -> Score {
        let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
        if lo <= WORST_SCORE {
            return hi;
        }
        let d = (hi - lo) as usize;
        match self.table.get(d) {
            Some(&v) => hi + v as Score,
            None => hi,
        }
    }

    /// Convert a natural-log value into the integer log domain.
    pub fn ln_to_log(&self, ln: f64) -> Score {
        if !ln.is_finite() {
            return WORST_SCORE;
        }
        let v = (ln / self.ln_of_base).round();
        if v <= WORST_SCORE as f64 {
            WORST_SCORE
        } else if v >= i32::MAX as f64 {
            i32::MAX
        } else {
            v as Score
        }
    }

    /// Convert an integer log-domain value back to natural log.
    pub fn log_to_ln(&self, score: Score) -> f64 {
        score as f64 * self.ln_of_base
    }

    /// Log of a linear probability. Zero and negative collapse to
    /// `WORST_SCORE`.
    pub fn log(&self, p: f64) -> Score {
        if p <= 0.0 {
            WORST_SCORE
        } else {
            self.ln_to_log(p.ln())
        }
    }

    /// Linear value of a log-domain score.
    pub fn exp(&self, score: Score) -> f64 {
        self.log_to_ln(score).exp()
    }
}
