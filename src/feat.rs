//! Cepstra to composed feature frames.
//!
//! The decoder scores one composed frame per input frame: the cepstral
//! vector, its delta over a +/-2 window and its double delta over a +/-3
//! window, concatenated. A seven-frame sliding window of raw cepstra is all
//! that is kept; the edges of the utterance are padded by replicating the
//! first and last frames, so every input frame yields exactly one output
//! frame.
//!
//! Optional running cepstral mean normalisation is applied to the raw
//! cepstra before they enter the window. The mean drifts within an
//! utterance and carries over to the next, which is the behaviour long-form
//! dictation wants.
use crate::error::{DecodeError, Result};
use ndarray::Array1;
use std::collections::VecDeque;

/// Half-width of the double-delta window, and therefore of the padding.
const FEAT_WINDOW: usize = 3;

#[derive(Debug)]
struct Cmn {
    mean: Array1<f32>,
    sum: Array1<f32>,
    n_frame: usize,
}

impl Cmn {
    fn new(n_cep: usize) -> Self {
        Self {
            mean: Array1::zeros(n_cep),
            sum: Array1::zeros(n_cep),
            n_frame: 0,
        }
    }

    /// Subtract the current mean estimate, then fold the frame into it. The
    /// accumulator is halved periodically so the estimate tracks slow channel
    /// drift instead of the whole session.
    fn apply(&mut self, cep: &mut Array1<f32>) {
        *cep -= &self.mean;
        self.sum += &*cep;
        self.sum += &self.mean;
        self.n_frame += 1;
        if self.n_frame >= 800 {
            self.sum.mapv_inplace(|v| v * 0.5);
            self.n_frame /= 2;
        }
        if self.n_frame > 0 {
            self.mean = &self.sum / self.n_frame as f32;
        }
    }
}

#[derive(Debug)]
pub struct FeatStream {
    n_cep: usize,
    cmn: Option<Cmn>,
    window: VecDeque<Array1<f32>>,
    out: VecDeque<Array1<f32>>,
    in_utt: bool,
    n_in: usize,
    last: Option<Array1<f32>>,
}

impl FeatStream {
    pub fn new(n_cep: usize, cmn: bool) -> Self {
        Self {
            n_cep,
            cmn: cmn.then(|| Cmn::new(n_cep)),
            window: VecDeque::with_capacity(2 * FEAT_WINDOW + 1),
            out: VecDeque::new(),
            in_utt: false,
            n_in: 0,
            last: None,
        }
    }

    pub fn n_cep(&self) -> usize {
        self.n_cep
    }

    /// Width of the composed frames this stream emits.
    pub fn out_dim(&self) -> usize {
        3 * self.n_cep
    }

    pub fn start_utt(&mut self) {
        self.window.clear();
        self.out.clear();
        self.in_utt = true;
        self.n_in = 0;
        self.last = None;
    }

    /// Feed one raw cepstral vector. Composed frames become available once
    /// the window fills and can be drained with [`FeatStream::pop`].
    pub fn push(&mut self, cep: &[f32]) -> Result<()> {
        if cep.len() != self.n_cep {
            return Err(DecodeError::ModelMismatch(format!(
                "cepstral vector has {} coefficients, configured for {}",
                cep.len(),
                self.n_cep
            )));
        }
        let mut cep = Array1::from_vec(cep.to_vec());
        if let Some(cmn) = self.cmn.as_mut() {
            cmn.apply(&mut cep);
        }
        if self.n_in == 0 {
            // Left-edge padding by replication.
            for _ in 0..FEAT_WINDOW {
                self.push_window(cep.clone());
            }
        }
        self.last = Some(cep.clone());
        self.push_window(cep);
        self.n_in += 1;
        Ok(())
    }

    /// Flush the right edge of the utterance; after this every input frame
    /// has a composed counterpart waiting in the queue.
    pub fn end_utt(&mut self) {
        if let Some(last) = self.last.clone() {
            for _ in 0..FEAT_WINDOW {
                self.push_window(last.clone());
            }
        }
        self.in_utt = false;
    }

    pub fn pop(&mut self) -> Option<Array1<f32>> {
        self.out.pop_front()
    }

    fn push_window(&mut self, cep: Array1<f32>) {
        self.window.push_back(cep);
        if self.window.len() == 2 * FEAT_WINDOW + 1 {
            self.out.push_back(self.compose());
            self.window.pop_front();
        }
    }

    /// Compose the centre frame of the full window: cepstra, delta from the
    /// +/-2 neighbours, double delta as the delta of the +/-1 deltas.
    fn compose(&self) -> Array1<f32> {
        let n = self.n_cep;
        let w = &self.window;
        let c = FEAT_WINDOW; // centre index
        let mut out = Array1::zeros(3 * n);
        for i in 0..n {
            let cep = w[c][i];
            let delta = w[c + 2][i] - w[c - 2][i];
            let dd = (w[c + 3][i] - w[c - 1][i]) - (w[c + 1][i] - w[c - 3][i]);
            out[i] = cep;
            out[n + i] = delta;
            out[2 * n + i] = dd;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(fs: &mut FeatStream) -> Vec<Array1<f32>> {
        std::iter::from_fn(|| fs.pop()).collect()
    }

    #[test]
    fn one_output_per_input() {
        let mut fs = FeatStream::new(2, false);
        fs.start_utt();
        for t in 0..10 {
            fs.push(&[t as f32, 0.0]).unwrap();
        }
        fs.end_utt();
        let frames = drain(&mut fs);
        assert_eq!(frames.len(), 10);
        assert_eq!(frames[0].len(), 6);
    }

    #[test]
    fn deltas_on_a_ramp() {
        // A linear ramp has constant delta and zero double delta away from
        // the edges.
        let mut fs = FeatStream::new(1, false);
        fs.start_utt();
        for t in 0..20 {
            fs.push(&[t as f32]).unwrap();
        }
        fs.end_utt();
        let frames = drain(&mut fs);
        let mid = &frames[10];
        assert_eq!(mid[0], 10.0);
        assert_eq!(mid[1], 4.0); // c[t+2] - c[t-2]
        assert_eq!(mid[2], 0.0);
        // Replicated left edge flattens the early deltas.
        assert!(frames[0][1] < 4.0);
    }

    #[test]
    fn cmn_removes_constant_offset() {
        let mut with = FeatStream::new(1, true);
        with.start_utt();
        for _ in 0..50 {
            with.push(&[42.0]).unwrap();
        }
        with.end_utt();
        let frames = drain(&mut with);
        // After the estimate settles the normalised cepstra approach zero.
        assert!(frames.last().unwrap()[0].abs() < 2.0);
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let mut fs = FeatStream::new(3, false);
        fs.start_utt();
        assert!(matches!(
            fs.push(&[0.0]),
            Err(DecodeError::ModelMismatch(_))
        ));
    }
}
