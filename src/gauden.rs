//! Gaussian codebooks and the top-N density shortlist.
//!
//! Means and variances are stored per codebook as `(density, dim)` arrays.
//! At construction the variances are floored, inverted and pre-scaled so a
//! density evaluation is a fused multiply-accumulate of squared differences
//! plus a precomputed log determinant. While being accumulated a density
//! value is the *denominator* of the Gaussian, so smaller is better; the
//! shortlist keeps the `n_top` smallest and bails out of a density as soon
//! as its partial sum is already worse than the current worst keeper.
use crate::error::{DecodeError, Result};
use crate::logmath::{LogMath, Score, WORST_SCORE};
use ndarray::{Array2, ArrayView1};
use std::sync::Arc;

/// One shortlisted density: its index in the codebook and its score in the
/// integer log domain.
#[derive(Debug, Clone, Copy)]
pub struct GaudenDist {
    pub id: u32,
    pub score: Score,
}

#[derive(Debug)]
pub struct Gauden {
    logmath: Arc<LogMath>,
    /// Per codebook, `(n_density, dim)`.
    means: Vec<Array2<f32>>,
    /// Precomputed `1 / (2 sigma^2)` with flooring applied.
    var_prec: Vec<Array2<f32>>,
    /// Precomputed log denominators per density.
    dets: Vec<Vec<f64>>,
    n_density: usize,
    dim: usize,
}

impl Gauden {
    /// Build codebooks from raw means and variances. Both vectors are
    /// indexed by codebook and shaped `(n_density, dim)`; variances below
    /// `var_floor` are clamped up to it.
    pub fn new(
        logmath: Arc<LogMath>,
        means: Vec<Array2<f32>>,
        variances: Vec<Array2<f32>>,
        var_floor: f32,
    ) -> Result<Self> {
        if means.is_empty() || means.len() != variances.len() {
            return Err(DecodeError::ModelMismatch(
                "means and variances must cover the same codebooks".into(),
            ));
        }
        let (n_density, dim) = means[0].dim();
        let mut var_prec = Vec::with_capacity(means.len());
        let mut dets = Vec::with_capacity(means.len());
        for (m, v) in means.iter().zip(&variances) {
            if m.dim() != (n_density, dim) || v.dim() != (n_density, dim) {
                return Err(DecodeError::ModelMismatch(format!(
                    "codebook shape {:?} does not match ({n_density}, {dim})",
                    m.dim()
                )));
            }
            let mut prec = Array2::zeros((n_density, dim));
            let mut det = vec![0f64; n_density];
            for d in 0..n_density {
                let mut log_den = dim as f64 * 0.5 * (2.0 * std::f64::consts::PI).ln();
                for i in 0..dim {
                    let var = v[(d, i)].max(var_floor) as f64;
                    log_den += 0.5 * var.ln();
                    prec[(d, i)] = (1.0 / (2.0 * var)) as f32;
                }
                det[d] = log_den;
            }
            var_prec.push(prec);
            dets.push(det);
        }
        Ok(Self {
            logmath,
            means,
            var_prec,
            dets,
            n_density,
            dim,
        })
    }

    pub fn n_codebook(&self) -> usize {
        self.means.len()
    }

    pub fn n_density(&self) -> usize {
        self.n_density
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Top-N densities of one codebook for an observation. Results arrive
    /// best first, converted to log-domain scores and floored at
    /// `WORST_SCORE`.
    pub fn dist(&self, codebook: usize, n_top: usize, obs: ArrayView1<f32>) -> Vec<GaudenDist> {
        debug_assert_eq!(obs.len(), self.dim);
        let n_top = n_top.min(self.n_density);
        let means = &self.means[codebook];
        let prec = &self.var_prec[codebook];
        let dets = &self.dets[codebook];

        // Shortlist ordered best (smallest denominator) first.
        let mut short: Vec<(u32, f64)> = vec![(u32::MAX, f64::MAX); n_top];
        for d in 0..self.n_density {
            let worst = short[n_top - 1].1;
            let mut dval = dets[d];
            for i in 0..self.dim {
                let diff = (obs[i] - means[(d, i)]) as f64;
                dval += diff * diff * prec[(d, i)] as f64;
                if dval > worst {
                    break;
                }
            }
            if dval >= worst {
                continue;
            }
            let pos = short.partition_point(|&(_, v)| v <= dval);
            short.pop();
            short.insert(pos, (d as u32, dval));
        }

        short
            .into_iter()
            .filter(|&(id, _)| id != u32::MAX)
            .map(|(id, dval)| GaudenDist {
                id,
                score: self.logmath.ln_to_log(-dval).max(WORST_SCORE),
            })
            .collect()
    }
}
