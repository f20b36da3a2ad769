//! Senone mixture weights and senone score computation.
//!
//! A senone is a tied HMM state: a row of mixture weights over one Gaussian
//! codebook. Two layouts are supported, mirroring the two acoustic model
//! families:
//!
//! - **continuous**: every senone has its own codebook (`sen2cb` is the
//!   identity or close to it); scoring a senone combines the codebook's
//!   shortlisted densities with that senone's weights;
//! - **semi-continuous / PTM**: all senones share codebook 0 and the whole
//!   score vector is produced in a single pass per shortlisted density.
//!
//! Weights are held as log-domain costs. Dense linear weights or 8-bit
//! quantized logs (the compact "sendump" layout) both convert into the same
//! internal table at construction.
use crate::error::{DecodeError, Result};
use crate::gauden::GaudenDist;
use crate::logmath::{LogMath, Score, WORST_SCORE};
use ndarray::Array2;
use std::sync::Arc;

/// Bit set over senone ids, used by the search to tell the scorer which
/// senones are live in a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenoneMask {
    bits: Vec<u64>,
    n: usize,
}

impl SenoneMask {
    pub fn new(n: usize) -> Self {
        Self {
            bits: vec![0; n.div_ceil(64)],
            n,
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn set(&mut self, sen: u32) {
        self.bits[sen as usize / 64] |= 1 << (sen % 64);
    }

    pub fn get(&self, sen: u32) -> bool {
        (self.bits[sen as usize / 64] >> (sen % 64)) & 1 != 0
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    pub fn union(&mut self, other: &SenoneMask) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= b;
        }
    }

    /// True if every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &SenoneMask) -> bool {
        self.bits
            .iter()
            .zip(&other.bits)
            .all(|(a, b)| a & !b == 0)
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.n as u32).filter(move |&s| self.get(s))
    }
}

#[derive(Debug)]
pub struct SenoneSet {
    /// `(n_sen, n_density)` log-domain weights (non-positive scores).
    mixw: Array2<Score>,
    /// Codebook of each senone.
    sen2cb: Vec<u32>,
    shared: bool,
}

impl SenoneSet {
    /// Dense linear weights, one row per senone.
    pub fn from_linear(
        logmath: &LogMath,
        weights: Array2<f32>,
        sen2cb: Vec<u32>,
    ) -> Result<Self> {
        let mixw = weights.mapv(|w| logmath.log(w as f64));
        Self::from_log(mixw, sen2cb)
    }

    /// 8-bit quantized log weights: each byte is a scaled negative log cost,
    /// `cost = -(q << shift)`.
    pub fn from_quantized(quantized: Array2<u8>, shift: u32, sen2cb: Vec<u32>) -> Result<Self> {
        let mixw = quantized.mapv(|q| -((q as Score) << shift));
        Self::from_log(mixw, sen2cb)
    }

    fn from_log(mixw: Array2<Score>, sen2cb: Vec<u32>) -> Result<Self> {
        if sen2cb.len() != mixw.nrows() {
            return Err(DecodeError::ModelMismatch(format!(
                "{} senones but {} codebook assignments",
                mixw.nrows(),
                sen2cb.len()
            )));
        }
        let shared = sen2cb.iter().all(|&cb| cb == 0);
        Ok(Self {
            mixw,
            sen2cb,
            shared,
        })
    }

    pub fn n_senone(&self) -> usize {
        self.mixw.nrows()
    }

    pub fn n_density(&self) -> usize {
        self.mixw.ncols()
    }

    /// Whether all senones share codebook 0 (semi-continuous layout).
    pub fn shared_codebook(&self) -> bool {
        self.shared
    }

    pub fn codebook(&self, sen: u32) -> u32 {
        self.sen2cb[sen as usize]
    }

    /// Score one senone from its codebook's shortlist.
    pub fn eval(&self, logmath: &LogMath, sen: u32, dist: &[GaudenDist]) -> Score {
        let mut score = WORST_SCORE;
        for d in dist {
            let w = self.mixw[(sen as usize, d.id as usize)];
            if w <= WORST_SCORE || d.score <= WORST_SCORE {
                continue;
            }
            score = logmath.add(score, d.score + w);
        }
        score
    }

    /// Shared-codebook scoring of the whole senone table in one pass per
    /// shortlisted density. `senscr` must hold `n_senone` slots; masked-out
    /// senones are left at `WORST_SCORE`.
    pub fn eval_all(
        &self,
        logmath: &LogMath,
        dist: &[GaudenDist],
        mask: Option<&SenoneMask>,
        senscr: &mut [Score],
    ) {
        debug_assert!(self.shared);
        senscr.fill(WORST_SCORE);
        for d in dist {
            if d.score <= WORST_SCORE {
                continue;
            }
            for sen in 0..self.n_senone() {
                if let Some(m) = mask {
                    if !m.get(sen as u32) {
                        continue;
                    }
                }
                let w = self.mixw[(sen, d.id as usize)];
                if w <= WORST_SCORE {
                    continue;
                }
                senscr[sen] = logmath.add(senscr[sen], d.score + w);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn mask_set_union_subset() {
        let mut a = SenoneMask::new(130);
        let mut b = SenoneMask::new(130);
        a.set(0);
        a.set(64);
        b.set(129);
        assert!(a.get(64));
        assert!(!a.get(1));
        let only_a = a.clone();
        a.union(&b);
        assert!(a.get(129));
        assert!(only_a.is_subset_of(&a));
        assert!(!a.is_subset_of(&only_a));
        assert_eq!(a.iter_set().collect::<Vec<_>>(), vec![0, 64, 129]);
        a.clear();
        assert!(a.is_empty());
    }

    #[test]
    fn eval_prefers_heavier_mixture() {
        let lmath = LogMath::new(1.0001).unwrap();
        // Two senones over a two-density codebook with opposite weights.
        let weights = arr2(&[[0.9f32, 0.1], [0.1, 0.9]]);
        let s = SenoneSet::from_linear(&lmath, weights, vec![0, 0]).unwrap();
        let dist = vec![
            GaudenDist { id: 0, score: 0 },
            GaudenDist {
                id: 1,
                score: -20_000,
            },
        ];
        // Density 0 dominates, so the senone weighting density 0 higher wins.
        let s0 = s.eval(&lmath, 0, &dist);
        let s1 = s.eval(&lmath, 1, &dist);
        assert!(s0 > s1);
    }

    #[test]
    fn eval_all_matches_eval() {
        let lmath = LogMath::new(1.0001).unwrap();
        let weights = arr2(&[[0.5f32, 0.5], [0.8, 0.2], [0.3, 0.7]]);
        let s = SenoneSet::from_linear(&lmath, weights, vec![0, 0, 0]).unwrap();
        let dist = vec![
            GaudenDist { id: 1, score: -10 },
            GaudenDist {
                id: 0,
                score: -5_000,
            },
        ];
        let mut senscr = vec![0; 3];
        s.eval_all(&lmath, &dist, None, &mut senscr);
        for sen in 0..3 {
            assert_eq!(senscr[sen as usize], s.eval(&lmath, sen, &dist));
        }
    }

    #[test]
    fn eval_all_honours_mask() {
        let lmath = LogMath::new(1.0001).unwrap();
        let weights = arr2(&[[1.0f32], [1.0]]);
        let s = SenoneSet::from_linear(&lmath, weights, vec![0, 0]).unwrap();
        let dist = vec![GaudenDist { id: 0, score: -3 }];
        let mut mask = SenoneMask::new(2);
        mask.set(1);
        let mut senscr = vec![0; 2];
        s.eval_all(&lmath, &dist, Some(&mask), &mut senscr);
        assert_eq!(senscr[0], WORST_SCORE);
        assert!(senscr[1] > WORST_SCORE);
    }

    #[test]
    fn quantized_weights_convert() {
        let q = arr2(&[[0u8, 255], [16, 0]]);
        let s = SenoneSet::from_quantized(q, 10, vec![0, 0]).unwrap();
        assert_eq!(s.mixw[(0, 0)], 0);
        assert_eq!(s.mixw[(0, 1)], -(255 << 10));
        assert_eq!(s.mixw[(1, 0)], -(16 << 10));
    }
}
