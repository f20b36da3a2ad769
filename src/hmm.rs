//! Fixed-topology HMM instances and their per-frame Viterbi update.
//!
//! Instances are small value types embedded in lexical-tree nodes, flat
//! word chains and alignment slots; the shared tables (transition matrices,
//! senone sequences) live in the model definition and are reached through an
//! [`HmmContext`]. The evaluator allocates nothing and cannot fail.
use crate::logmath::{Score, WORST_SCORE};
use crate::mdef::{ModelDef, SseqId, TmatId};
use std::sync::Arc;

/// Frame index. `NO_FRAME` doubles as "inactive".
pub type Frame = i32;
pub const NO_FRAME: Frame = -1;

/// Index into a backpointer table. Which table depends on the search that
/// owns the HMM.
pub type HistId = i32;
pub const NO_HIST: HistId = -1;

/// Upper bound on emitting states; topologies are 3 or 5 states.
pub const MAX_EMIT_STATES: usize = 5;

#[derive(Debug, Clone)]
pub struct HmmContext {
    mdef: Arc<ModelDef>,
    n_emit: usize,
}

impl HmmContext {
    pub fn new(mdef: Arc<ModelDef>) -> Self {
        let n_emit = mdef.n_emit_state();
        assert!(n_emit >= 1 && n_emit <= MAX_EMIT_STATES);
        Self { mdef, n_emit }
    }

    pub fn n_emit(&self) -> usize {
        self.n_emit
    }

    pub fn mdef(&self) -> &Arc<ModelDef> {
        &self.mdef
    }

    /// One Viterbi step over `hmm` given this frame's senone scores. Updates
    /// the state scores, the exit pseudo-state and the HMM's best score, and
    /// returns the best state score for pruning. Ties go to the lower state
    /// index.
    pub fn eval(&self, hmm: &mut Hmm, senscr: &[Score]) -> Score {
        let n = self.n_emit;
        let tmat = self.mdef.tmat(hmm.tmat);
        let senones = self.mdef.sseq_senones(hmm.sseq);

        let mut prev = [WORST_SCORE; MAX_EMIT_STATES];
        let mut prev_hist = [NO_HIST; MAX_EMIT_STATES];
        prev[..n].copy_from_slice(&hmm.score[..n]);
        prev_hist[..n].copy_from_slice(&hmm.history[..n]);

        let mut best = WORST_SCORE;
        for s in 0..n {
            let mut score = WORST_SCORE;
            let mut hist = NO_HIST;
            // Predecessors in increasing order so the lower index wins ties.
            for p in 0..=s {
                let tp = tmat[(p, s)];
                if tp <= WORST_SCORE || prev[p] <= WORST_SCORE {
                    continue;
                }
                let cand = prev[p] + tp;
                if cand > score {
                    score = cand;
                    hist = prev_hist[p];
                }
            }
            if score > WORST_SCORE {
                // Saturate so repeated terrible emissions cannot wrap.
                score = score
                    .saturating_add(senscr[senones[s] as usize])
                    .max(WORST_SCORE);
            }
            hmm.score[s] = score;
            hmm.history[s] = hist;
            if score > best {
                best = score;
            }
        }

        // Non-emitting exit, fed by the freshly updated state scores.
        let mut out = WORST_SCORE;
        let mut out_hist = NO_HIST;
        for p in 0..n {
            let tp = tmat[(p, n)];
            if tp <= WORST_SCORE || hmm.score[p] <= WORST_SCORE {
                continue;
            }
            let cand = hmm.score[p] + tp;
            if cand > out {
                out = cand;
                out_hist = hmm.history[p];
            }
        }
        hmm.out_score = out;
        hmm.out_history = out_hist;
        hmm.best_score = best;
        best
    }
}

/// A single HMM instance: state scores, history pointers and the frame stamp
/// that doubles as the activity marker.
#[derive(Debug, Clone)]
pub struct Hmm {
    pub score: [Score; MAX_EMIT_STATES],
    pub history: [HistId; MAX_EMIT_STATES],
    pub out_score: Score,
    pub out_history: HistId,
    pub best_score: Score,
    pub frame: Frame,
    pub sseq: SseqId,
    pub tmat: TmatId,
}

impl Hmm {
    pub fn new(sseq: SseqId, tmat: TmatId) -> Self {
        Self {
            score: [WORST_SCORE; MAX_EMIT_STATES],
            history: [NO_HIST; MAX_EMIT_STATES],
            out_score: WORST_SCORE,
            out_history: NO_HIST,
            best_score: WORST_SCORE,
            frame: NO_FRAME,
            sseq,
            tmat,
        }
    }

    /// Seed the entry state for evaluation at `frame`. Merges with whatever
    /// score is already there (a surviving self-loop path keeps the state if
    /// it is better). Returns whether the HMM was not yet scheduled for
    /// `frame`, i.e. the caller should put it on the active list.
    pub fn enter(&mut self, score: Score, history: HistId, frame: Frame) -> bool {
        if score > self.score[0] {
            self.score[0] = score;
            self.history[0] = history;
        }
        let fresh = self.frame != frame;
        self.frame = frame;
        fresh
    }

    /// Entry-state score; what a competing `enter` has to beat.
    pub fn in_score(&self) -> Score {
        self.score[0]
    }

    pub fn is_active(&self, frame: Frame) -> bool {
        self.frame >= frame
    }

    /// Reset to the pristine inactive state.
    pub fn clear(&mut self) {
        self.score = [WORST_SCORE; MAX_EMIT_STATES];
        self.history = [NO_HIST; MAX_EMIT_STATES];
        self.out_score = WORST_SCORE;
        self.out_history = NO_HIST;
        self.best_score = WORST_SCORE;
        self.frame = NO_FRAME;
    }
}
