//! The acoustic scorer: owns the feature stream and the Gaussian machinery
//! and hands the search one senone score vector per frame.
//!
//! Frames are produced strictly in order into a small cache and may be
//! consumed out of order within it. `score_frame` is idempotent for a frame
//! still in the cache; `advance` releases the oldest frame. Asking for a
//! released frame is `OutOfBounds`, asking ahead of the audio is
//! `OutOfData`.
//!
//! Instead of computing, the scorer can replay a saved score matrix; it can
//! also tee everything it computes to one, which makes search behaviour
//! reproducible without the Gaussian pipeline.
use crate::config::DecoderConfig;
use crate::error::{DecodeError, Result};
use crate::feat::FeatStream;
use crate::gauden::{Gauden, GaudenDist};
use crate::hmm::Frame;
use crate::logmath::{LogMath, Score, WORST_SCORE};
use crate::senone::{SenoneMask, SenoneSet};
use ndarray::{Array1, Array2};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct CachedFrame {
    feat: Array1<f32>,
    scores: Option<Vec<Score>>,
    /// Mask the scores were computed under; `None` means all senones.
    mask: Option<SenoneMask>,
}

/// Converts raw PCM into cepstral vectors. Real front ends (mel filterbank,
/// MFCC) live outside this crate; [`EnergyFrontEnd`] is a toy for tests and
/// the demo binary.
pub trait FrontEnd: Send {
    fn n_cep(&self) -> usize;
    /// Consume samples, appending any completed cepstral frames to `out`.
    fn process(&mut self, samples: &[i16], out: &mut Vec<Vec<f32>>);
    /// Flush any buffered partial frame at end of utterance.
    fn finish(&mut self, out: &mut Vec<Vec<f32>>);
}

/// Log-energy front end: one coefficient, 10 ms frames. Only good enough to
/// exercise the decoder plumbing on synthetic audio.
pub struct EnergyFrontEnd {
    frame_len: usize,
    buf: Vec<i16>,
}

impl EnergyFrontEnd {
    pub fn new(sample_rate: usize) -> Self {
        Self {
            frame_len: sample_rate / 100,
            buf: Vec::new(),
        }
    }
}

impl FrontEnd for EnergyFrontEnd {
    fn n_cep(&self) -> usize {
        1
    }

    fn process(&mut self, samples: &[i16], out: &mut Vec<Vec<f32>>) {
        self.buf.extend_from_slice(samples);
        while self.buf.len() >= self.frame_len {
            let frame: Vec<i16> = self.buf.drain(..self.frame_len).collect();
            let energy: f64 = frame
                .iter()
                .map(|&s| (s as f64 / i16::MAX as f64).powi(2))
                .sum();
            out.push(vec![(energy.max(1e-10)).ln() as f32]);
        }
    }

    fn finish(&mut self, _out: &mut Vec<Vec<f32>>) {
        self.buf.clear();
    }
}

pub struct AcousticScorer {
    logmath: Arc<LogMath>,
    feat: FeatStream,
    gauden: Gauden,
    senones: SenoneSet,
    n_top: usize,
    cache_capacity: usize,
    cache: VecDeque<CachedFrame>,
    /// Frame index of the cache front.
    base: Frame,
    n_frames_in: usize,
    replay: Option<Array2<Score>>,
    /// Row offset of the current utterance within the replay matrix.
    replay_base: usize,
    tee: Option<(PathBuf, Vec<Vec<Score>>)>,
    /// Rows of the current utterance, merged into the tee at `end_utt`.
    tee_utt: Vec<Vec<Score>>,
    in_utt: bool,
    sen_evals: u64,
}

impl AcousticScorer {
    pub fn new(
        config: &DecoderConfig,
        logmath: Arc<LogMath>,
        gauden: Gauden,
        senones: SenoneSet,
    ) -> Result<Self> {
        if gauden.dim() != 3 * config.n_cep {
            return Err(DecodeError::ModelMismatch(format!(
                "codebooks are {}-dimensional but composed frames are {}",
                gauden.dim(),
                3 * config.n_cep
            )));
        }
        if !senones.shared_codebook() && senones.n_senone() > 0 {
            let max_cb = (0..senones.n_senone() as u32)
                .map(|s| senones.codebook(s))
                .max()
                .unwrap();
            if max_cb as usize >= gauden.n_codebook() {
                return Err(DecodeError::ModelMismatch(format!(
                    "senones reference codebook {max_cb} of {}",
                    gauden.n_codebook()
                )));
            }
        }
        let replay = match &config.senone_replay {
            Some(path) => {
                let m: Array2<Score> = ndarray_npy::read_npy(path).map_err(|e| {
                    DecodeError::Config(format!("cannot read replay scores {path:?}: {e}"))
                })?;
                if m.ncols() != senones.n_senone() {
                    return Err(DecodeError::ModelMismatch(format!(
                        "replay matrix has {} senones, model has {}",
                        m.ncols(),
                        senones.n_senone()
                    )));
                }
                info!(frames = m.nrows(), "replaying senone scores");
                Some(m)
            }
            None => None,
        };
        Ok(Self {
            logmath,
            feat: FeatStream::new(config.n_cep, config.cmn),
            gauden,
            senones,
            n_top: config.n_top,
            cache_capacity: config.frame_cache,
            cache: VecDeque::new(),
            base: 0,
            n_frames_in: 0,
            replay,
            replay_base: 0,
            tee: config.senone_tee.clone().map(|p| (p, Vec::new())),
            tee_utt: Vec::new(),
            in_utt: false,
            sen_evals: 0,
        })
    }

    pub fn n_senone(&self) -> usize {
        self.senones.n_senone()
    }

    pub fn start_utt(&mut self) {
        self.feat.start_utt();
        self.cache.clear();
        self.base = 0;
        self.n_frames_in = 0;
        self.tee_utt.clear();
        self.in_utt = true;
    }

    /// Feed cepstral vectors; composed frames land in the cache.
    pub fn process_cep(&mut self, frames: &[Vec<f32>]) -> Result<()> {
        for cep in frames {
            self.feat.push(cep)?;
        }
        self.drain_feat();
        Ok(())
    }

    /// Flush the tail of the feature window; every fed frame is in the
    /// cache afterwards. Scoring is still allowed until `end_utt`.
    pub fn flush_features(&mut self) {
        self.feat.end_utt();
        self.drain_feat();
    }

    /// Close the utterance and, if configured, rewrite the tee file with
    /// everything computed so far this session.
    pub fn end_utt(&mut self) -> Result<()> {
        if self.in_utt {
            self.flush_features();
        }
        self.in_utt = false;
        self.replay_base += self.n_frames_in;
        if let Some((path, rows)) = &mut self.tee {
            rows.append(&mut self.tee_utt);
            if !rows.is_empty() {
                let n_sen = self.senones.n_senone();
                let mut m = Array2::from_elem((rows.len(), n_sen), WORST_SCORE);
                for (i, row) in rows.iter().enumerate() {
                    if !row.is_empty() {
                        m.row_mut(i).assign(&Array1::from_vec(row.clone()));
                    }
                }
                let path = path.clone();
                ndarray_npy::write_npy(&path, &m)
                    .map_err(|e| DecodeError::Config(format!("cannot tee scores: {e}")))?;
                debug!(frames = m.nrows(), ?path, "senone scores written");
            }
        }
        Ok(())
    }

    fn drain_feat(&mut self) {
        while let Some(feat) = self.feat.pop() {
            self.cache.push_back(CachedFrame {
                feat,
                scores: None,
                mask: None,
            });
            self.n_frames_in += 1;
        }
        if self.cache.len() > self.cache_capacity {
            warn!(
                cached = self.cache.len(),
                capacity = self.cache_capacity,
                "score cache over capacity; caller is feeding faster than it decodes"
            );
        }
    }

    /// Frames available so far: valid frame indices are
    /// `advanced.. frames_ready()`.
    pub fn frames_ready(&self) -> Frame {
        self.base + self.cache.len() as Frame
    }

    pub fn in_utt(&self) -> bool {
        self.in_utt
    }

    pub fn sen_evals(&self) -> u64 {
        self.sen_evals
    }

    /// Release the oldest cached frame.
    pub fn advance(&mut self) {
        if self.cache.pop_front().is_some() {
            self.base += 1;
        }
    }

    /// Senone scores for a frame, computing them on first request. With a
    /// mask only the masked senones are guaranteed meaningful; the rest sit
    /// at `WORST_SCORE`. A wider follow-up request recomputes the frame.
    pub fn score_frame(&mut self, frame: Frame, mask: Option<&SenoneMask>) -> Result<&[Score]> {
        if frame < self.base {
            return Err(DecodeError::OutOfBounds { frame });
        }
        let idx = (frame - self.base) as usize;
        if idx >= self.cache.len() {
            return Err(DecodeError::OutOfData { frame });
        }

        let needs_compute = match &self.cache[idx].scores {
            None => true,
            Some(_) => match (&self.cache[idx].mask, mask) {
                (None, _) => false,
                (Some(old), Some(new)) => !new.is_subset_of(old),
                (Some(_), None) => true,
            },
        };
        if needs_compute {
            let scores = self.compute(idx, mask)?;
            if self.tee.is_some() {
                let f = frame as usize;
                if self.tee_utt.len() <= f {
                    self.tee_utt.resize(f + 1, Vec::new());
                }
                self.tee_utt[f] = scores.clone();
            }
            self.cache[idx].scores = Some(scores);
            self.cache[idx].mask = mask.cloned();
        }
        Ok(self.cache[idx].scores.as_deref().unwrap())
    }

    fn compute(&mut self, idx: usize, mask: Option<&SenoneMask>) -> Result<Vec<Score>> {
        let n_sen = self.senones.n_senone();
        if let Some(replay) = &self.replay {
            let frame = (self.base as usize) + idx;
            let row = self.replay_base + frame;
            if row >= replay.nrows() {
                return Err(DecodeError::OutOfData {
                    frame: frame as Frame,
                });
            }
            return Ok(replay.row(row).to_vec());
        }

        let obs = self.cache[idx].feat.view();
        let mut senscr = vec![WORST_SCORE; n_sen];
        if self.senones.shared_codebook() {
            let dist = self.gauden.dist(0, self.n_top, obs);
            self.senones
                .eval_all(&self.logmath, &dist, mask, &mut senscr);
            self.sen_evals += match mask {
                Some(m) => m.iter_set().count() as u64,
                None => n_sen as u64,
            };
        } else {
            // Per-codebook shortlists, computed lazily for the codebooks the
            // live senones actually touch.
            let mut dists: Vec<Option<Vec<GaudenDist>>> = vec![None; self.gauden.n_codebook()];
            for sen in 0..n_sen as u32 {
                if let Some(m) = mask {
                    if !m.get(sen) {
                        continue;
                    }
                }
                let cb = self.senones.codebook(sen) as usize;
                if dists[cb].is_none() {
                    dists[cb] = Some(self.gauden.dist(cb, self.n_top, obs));
                }
                senscr[sen as usize] =
                    self.senones
                        .eval(&self.logmath, sen, dists[cb].as_ref().unwrap());
                self.sen_evals += 1;
            }
        }
        Ok(senscr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn scorer(cache: usize) -> AcousticScorer {
        let lmath = LogMath::new(1.0001).unwrap();
        let config = DecoderConfig {
            n_cep: 1,
            cmn: false,
            frame_cache: cache,
            n_top: 2,
            ..Default::default()
        };
        // Two 3-dimensional densities (matching composed frames of 1 cep):
        // one near silence (0) and one near speech (5).
        let means = Array2::from_shape_vec(
            (2, 3),
            vec![0.0, 0.0, 0.0, 5.0, 0.0, 0.0],
        )
        .unwrap();
        let vars = Array2::from_elem((2, 3), 1.0);
        let gauden = Gauden::new(lmath.clone(), vec![means], vec![vars], 1e-4).unwrap();
        let weights = Array2::from_shape_vec((2, 2), vec![1.0f32, 0.0, 0.0, 1.0]).unwrap();
        let senones = SenoneSet::from_linear(&lmath, weights, vec![0, 0]).unwrap();
        AcousticScorer::new(&config, lmath, gauden, senones).unwrap()
    }

    fn feed(s: &mut AcousticScorer, value: f32, n: usize) {
        s.process_cep(&vec![vec![value]; n]).unwrap();
    }

    #[test]
    fn scores_discriminate_and_are_idempotent() {
        let mut s = scorer(16);
        s.start_utt();
        feed(&mut s, 0.0, 8);
        // The delta window holds back the last few frames until end_utt.
        assert_eq!(s.frames_ready(), 5);
        let first = s.score_frame(4, None).unwrap().to_vec();
        // Silence-like input scores senone 0 above senone 1.
        assert!(first[0] > first[1]);
        let again = s.score_frame(4, None).unwrap().to_vec();
        assert_eq!(first, again);
    }

    #[test]
    fn eviction_and_lookahead_errors() {
        let mut s = scorer(16);
        s.start_utt();
        feed(&mut s, 0.0, 4);
        s.score_frame(0, None).unwrap();
        s.advance();
        assert!(matches!(
            s.score_frame(0, None),
            Err(DecodeError::OutOfBounds { frame: 0 })
        ));
        assert!(matches!(
            s.score_frame(4, None),
            Err(DecodeError::OutOfData { frame: 4 })
        ));
        s.end_utt().unwrap();
    }

    #[test]
    fn widening_the_mask_recomputes() {
        let mut s = scorer(16);
        s.start_utt();
        feed(&mut s, 5.0, 8);
        let mut narrow = SenoneMask::new(2);
        narrow.set(0);
        let scores = s.score_frame(1, Some(&narrow)).unwrap();
        assert_eq!(scores[1], WORST_SCORE);
        let mut wide = SenoneMask::new(2);
        wide.set(0);
        wide.set(1);
        let scores = s.score_frame(1, Some(&wide)).unwrap();
        // Speech-like input now visible on senone 1, and better than 0.
        assert!(scores[1] > scores[0]);
    }

    #[test]
    fn end_utt_flushes_every_frame() {
        let mut s = scorer(64);
        s.start_utt();
        feed(&mut s, 1.0, 10);
        s.end_utt().unwrap();
        assert_eq!(s.frames_ready(), 10);
        s.score_frame(9, None).unwrap();
    }
}
