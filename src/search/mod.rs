//! The capability set every search mode implements.
//!
//! Forward tree decoding, forced state alignment and any externally provided
//! modes (grammar, keyword) all present the same surface: start, one step
//! per frame, finish, and result getters. The decoder facade owns a registry
//! of named boxed searches and drives whichever is active; there is no
//! deeper hierarchy than this trait.
use crate::acmod::AcousticScorer;
use crate::dict::WordId;
use crate::error::Result;
use crate::hmm::Frame;
use crate::lattice::Lattice;
use crate::logmath::Score;
use std::sync::Arc;

pub mod align;
pub mod fwdflat;
pub mod fwdtree;

#[derive(Debug, Clone)]
pub struct Hypothesis {
    pub text: String,
    pub score: Score,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub word: String,
    pub wid: WordId,
    pub sf: Frame,
    pub ef: Frame,
    pub ascr: Score,
    pub lscr: Score,
    /// Log link posterior, when lattice posteriors have been computed.
    pub post: Option<Score>,
}

/// Work accounting for one frame, aggregated into the session counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepStats {
    pub hmm_evals: u64,
    pub word_exits: u64,
}

pub trait Search: Send {
    fn name(&self) -> &str;

    fn start(&mut self, scorer: &mut AcousticScorer) -> Result<()>;

    /// Advance one frame. The scorer has the frame's features cached; the
    /// search asks it for scores under its own active-senone mask.
    fn step(&mut self, scorer: &mut AcousticScorer, frame: Frame) -> Result<StepStats>;

    fn finish(&mut self, scorer: &mut AcousticScorer) -> Result<()>;

    /// Reset per-utterance state without rebuilding the static structures.
    fn reinit(&mut self) -> Result<()> {
        Ok(())
    }

    fn hypothesis(&mut self) -> Option<Hypothesis>;

    /// Mid-utterance best guess; cheaper and rougher than `hypothesis`.
    fn partial_hypothesis(&mut self) -> Option<Hypothesis> {
        None
    }

    fn segments(&mut self) -> Vec<Segment>;

    fn lattice(&mut self) -> Option<Arc<Lattice>> {
        None
    }

    /// Log posterior of the reported hypothesis, where supported.
    fn posterior(&mut self) -> Option<Score> {
        None
    }

    /// The filled time alignment, for searches that produce one.
    fn alignment(&self) -> Option<&align::Alignment> {
        None
    }
}
