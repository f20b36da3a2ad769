//! First-pass frame-synchronous Viterbi over interleaved lexical trees.
//!
//! One copy of the tree cannot hold two histories apart: Viterbi keeps a
//! single token per state, so a word entered in frame f and again in frame
//! f+2 collide inside the shared prefix and the later (often better-scoring)
//! history silently wins. Running a small set of tree copies and rotating
//! word entries across them keeps recent histories in separate state spaces
//! at a linear cost. Three copies is the conventional compromise.
//!
//! Per frame: collect the active senones, score them, Viterbi-update every
//! active HMM, derive the beam thresholds (tightened by a coarse histogram
//! when too many HMMs survive), propagate inside the trees, flush word exits
//! into the history table, prune it, and re-enter the trees from the
//! surviving exits, using the exiting word's final CI phone as the next
//! word's left context.
//!
//! When configured, `finish` runs the flat-lexicon second pass over the
//! cached frames before reporting.
use crate::acmod::AcousticScorer;
use crate::config::DecoderConfig;
use crate::dict::{Dictionary, WordId};
use crate::dict2pid::PhoneIdMap;
use crate::error::{DecodeError, Result};
use crate::hmm::{Frame, HistId, HmmContext, NO_HIST};
use crate::lattice::Lattice;
use crate::lextree::LexTree;
use crate::lm::{FillerPenalties, LanguageModel, LmWordId, NO_LM_WORD};
use crate::logmath::{LogMath, Score, WORST_SCORE};
use crate::search::{Hypothesis, Search, Segment, StepStats};
use crate::search::fwdflat::FlatRescore;
use crate::senone::SenoneMask;
use crate::vithist::{LmContext, ViterbiHistory};
use std::sync::Arc;
use tracing::{debug, info, warn};

const HIST_BINS: usize = 1000;

pub struct TreeSearch {
    name: String,
    logmath: Arc<LogMath>,
    dict: Arc<Dictionary>,
    d2p: Arc<PhoneIdMap>,
    lm: Arc<dyn LanguageModel>,
    fillpen: FillerPenalties,
    dict2lm: Vec<LmWordId>,
    hmm_ctx: HmmContext,

    trees: Vec<LexTree>,
    filler_trees: Vec<LexTree>,
    vh: ViterbiHistory,

    hmm_beam: Score,
    phone_beam: Score,
    word_beam: Score,
    word_end_beam: Option<Score>,
    max_hmm_per_frame: usize,
    max_words_per_frame: usize,
    max_hist_per_frame: usize,
    entries_per_tree: usize,
    n_word_trans: usize,

    frame: Frame,
    mask: SenoneMask,
    /// Per final-CI-phone best exit of the frame, scratch for transitions.
    word_best: Vec<(Score, HistId)>,

    flat_rescore: bool,
    flat_window: i32,

    /// Result state: the reporting history (second pass when it ran) and its
    /// exit entry.
    result: Option<(ViterbiHistory, HistId)>,
    lattice: Option<Arc<Lattice>>,
}

impl TreeSearch {
    pub fn new(
        name: &str,
        config: &DecoderConfig,
        logmath: Arc<LogMath>,
        dict: Arc<Dictionary>,
        d2p: Arc<PhoneIdMap>,
        lm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let mdef = dict.mdef().clone();
        let dict2lm: Vec<LmWordId> = (0..dict.len() as WordId)
            .map(|w| lm.word_id(dict.text(dict.base_wid(w))).unwrap_or(NO_LM_WORD))
            .collect();

        // Tree vocabulary: every real word the LM knows, with its unigram
        // score as look-ahead.
        let mut words: Vec<(WordId, Score)> = Vec::new();
        for wid in dict.real_words() {
            let lwid = dict2lm[wid as usize];
            if lwid == NO_LM_WORD {
                continue;
            }
            let prob = if config.lm_lookahead {
                lm.score(lwid, &[]).0
            } else {
                0
            };
            words.push((wid, prob));
        }
        if words.is_empty() {
            return Err(DecodeError::Config(
                "no dictionary word is covered by the language model".into(),
            ));
        }
        let skipped = dict.real_words().count() - words.len();
        if skipped > 0 {
            warn!(skipped, "dictionary words absent from the LM left out of the tree");
        }

        let n_tree = config.n_tree.max(1);
        let tree = LexTree::new_ngram(dict.clone(), d2p.clone(), &words);
        let trees = vec![tree; n_tree];
        let filler = LexTree::new_filler(dict.clone(), d2p.clone());
        let filler_trees = vec![filler; n_tree];

        let fillpen = FillerPenalties::new(
            &logmath,
            &dict,
            config.silence_prob,
            config.filler_prob,
            config.language_weight,
        );
        let word_beam = logmath.log(config.word_beam);
        info!(
            name,
            n_tree,
            words = words.len(),
            "tree search initialised"
        );
        Ok(Self {
            name: name.to_string(),
            hmm_beam: logmath.log(config.hmm_beam),
            phone_beam: logmath.log(config.phone_beam),
            word_beam,
            word_end_beam: (config.word_end_beam > 0.0)
                .then(|| logmath.log(config.word_end_beam)),
            logmath,
            hmm_ctx: HmmContext::new(mdef.clone()),
            dict,
            d2p,
            lm,
            fillpen,
            dict2lm,
            trees,
            filler_trees,
            vh: ViterbiHistory::new(word_beam),
            max_hmm_per_frame: config.max_hmm_per_frame,
            max_words_per_frame: config.max_words_per_frame,
            max_hist_per_frame: config.max_hist_per_frame,
            entries_per_tree: config.entries_per_tree.max(1),
            n_word_trans: 0,
            frame: 0,
            mask: SenoneMask::new(mdef.n_senone()),
            word_best: vec![(WORST_SCORE, NO_HIST); mdef.n_ciphone()],
            flat_rescore: config.flat_rescore,
            flat_window: config.flat_window,
            result: None,
            lattice: None,
        })
    }

    /// Word exits of the frame re-enter the trees: the best exit per final
    /// CI phone seeds the tree copy of the current rotation under that left
    /// context, and the frame's best exit seeds the filler tree.
    fn word_transitions(&mut self, frame: Frame, threshold: Score) {
        let (best_id, best_score) = self.vh.best_exit(frame);
        if best_id < 0 {
            return;
        }
        let sil = self.dict.mdef().silence_phone();
        for slot in self.word_best.iter_mut() {
            *slot = (WORST_SCORE, NO_HIST);
        }
        let mut max_exit = WORST_SCORE;
        for i in self.vh.frame_range(frame) {
            let e = self.vh.entry(i as HistId);
            let mut p = self.dict.last_phone(e.wid);
            if self.dict.mdef().is_filler_phone(p) {
                p = sil;
            }
            if e.score > self.word_best[p as usize].0 {
                self.word_best[p as usize] = (e.score, i as HistId);
                max_exit = max_exit.max(e.score);
            }
        }

        let k = self.n_word_trans
            % (self.trees.len() * self.entries_per_tree)
            / self.entries_per_tree;
        self.n_word_trans += 1;

        for p in 0..self.word_best.len() {
            let (score, id) = self.word_best[p];
            if id < 0 {
                continue;
            }
            let pass = match self.word_end_beam {
                None => true,
                Some(beam) => score > beam + max_exit,
            };
            if pass {
                self.trees[k].enter(p as u16, frame, score, id, threshold);
            }
        }
        self.filler_trees[k].enter(sil, frame, best_score, best_id, threshold);
    }

    fn run_flat_pass(&mut self, scorer: &mut AcousticScorer) -> Result<Option<(ViterbiHistory, HistId)>> {
        let n_frames = self.vh.n_frames();
        let mut flat = FlatRescore::new(
            self.dict.clone(),
            self.d2p.clone(),
            &self.vh,
            self.flat_window,
            self.hmm_beam,
            self.word_beam,
            self.max_words_per_frame,
            self.max_hist_per_frame,
        );
        flat.start(self.lm.start_id());
        for f in 0..n_frames {
            self.mask.clear();
            flat.active_senones(f, &mut self.mask);
            if self.mask.is_empty() {
                warn!(frame = f, "flat pass lost all paths, keeping first-pass result");
                return Ok(None);
            }
            let senscr = match scorer.score_frame(f, Some(&self.mask)) {
                Ok(s) => s.to_vec(),
                Err(DecodeError::OutOfBounds { .. }) => {
                    warn!("frames already released, keeping first-pass result");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            let lm = self.lm.clone();
            let ctx = LmContext {
                lm: &*lm,
                dict: &self.dict,
                d2p: &self.d2p,
                fillpen: &self.fillpen,
                dict2lm: &self.dict2lm,
            };
            flat.step(&self.hmm_ctx, &ctx, f, &senscr)?;
        }
        let lm = self.lm.clone();
        let ctx = LmContext {
            lm: &*lm,
            dict: &self.dict,
            d2p: &self.d2p,
            fillpen: &self.fillpen,
            dict2lm: &self.dict2lm,
        };
        match flat.finish(&ctx) {
            Ok((vh, exit)) => Ok(Some((vh, exit))),
            Err(DecodeError::EmptyUtterance) => {
                warn!("flat pass produced no exits, keeping first-pass result");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn result_backtrace(&self) -> Option<Vec<Segment>> {
        let (vh, exit) = self.result.as_ref()?;
        let mut segments = Vec::new();
        for id in vh.backtrace(*exit) {
            let e = vh.entry(id);
            segments.push(Segment {
                word: self.dict.text(e.wid).to_string(),
                wid: e.wid,
                sf: e.sf,
                ef: e.ef,
                ascr: e.ascr,
                lscr: e.lscr,
                post: None,
            });
        }
        Some(segments)
    }
}

impl Search for TreeSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, _scorer: &mut AcousticScorer) -> Result<()> {
        for tree in self.trees.iter_mut().chain(&mut self.filler_trees) {
            tree.utt_end();
        }
        self.vh
            .utt_begin(self.dict.start_wid(), self.lm.start_id());
        self.frame = 0;
        self.n_word_trans = 0;
        self.result = None;
        self.lattice = None;

        // Everything starts from the sentinel under a silence context.
        let sil = self.dict.mdef().silence_phone();
        self.trees[0].enter(sil, -1, 0, 0, self.hmm_beam);
        self.filler_trees[0].enter(sil, -1, 0, 0, self.hmm_beam);
        for tree in self.trees.iter_mut().chain(&mut self.filler_trees) {
            tree.swap_active();
        }
        Ok(())
    }

    fn step(&mut self, scorer: &mut AcousticScorer, frame: Frame) -> Result<StepStats> {
        debug_assert_eq!(frame, self.frame);
        let mut stats = StepStats::default();

        self.mask.clear();
        let mut n_active = 0;
        for tree in self.trees.iter().chain(&self.filler_trees) {
            tree.active_senones(&mut self.mask);
            n_active += tree.n_active();
        }
        if n_active == 0 {
            // Every path fell out of beam; nothing to score, keep the frame
            // bookkeeping consistent and let the utterance end gracefully.
            warn!(frame, "no active HMMs");
            self.vh.frame_windup(frame);
            self.frame += 1;
            return Ok(stats);
        }
        let senscr = scorer.score_frame(frame, Some(&self.mask))?.to_vec();

        let mut best = WORST_SCORE;
        let mut wbest = WORST_SCORE;
        for tree in self.trees.iter_mut().chain(&mut self.filler_trees) {
            let (b, wb) = tree.hmm_eval(&self.hmm_ctx, &senscr, frame);
            best = best.max(b);
            wbest = wbest.max(wb);
        }
        stats.hmm_evals += n_active as u64;
        if best > 0 {
            return Err(DecodeError::InternalInvariant(format!(
                "best HMM score {best} > 0 at frame {frame}: score wrap-around"
            )));
        }

        // Beam thresholds, tightened by histogram when over the HMM budget.
        let (mut hb, mut pb, mut wb) = (self.hmm_beam, self.phone_beam, self.word_beam);
        if n_active > self.max_hmm_per_frame + self.max_hmm_per_frame / 2 {
            let bin_width = ((-self.hmm_beam) as usize / HIST_BINS).max(1) as Score;
            let mut bins = [0usize; HIST_BINS];
            for tree in self.trees.iter().chain(&self.filler_trees) {
                tree.histbin(best, &mut bins, bin_width);
            }
            let mut kept = 0;
            let mut i = 0;
            while i < HIST_BINS && kept < self.max_hmm_per_frame {
                kept += bins[i];
                i += 1;
            }
            hb = -(i as Score * bin_width);
            pb = pb.max(hb);
            wb = wb.max(hb);
            debug!(frame, n_active, tightened = hb, "histogram pruning");
        }
        let th = best + hb;
        let pth = best + pb;
        let wth = wbest + wb;

        for tree in self.trees.iter_mut().chain(&mut self.filler_trees) {
            tree.propagate_non_leaves(frame, th, pth);
        }

        {
            let vh = &mut self.vh;
            let lm = self.lm.clone();
            let ctx = LmContext {
                lm: &*lm,
                dict: &self.dict,
                d2p: &self.d2p,
                fillpen: &self.fillpen,
                dict2lm: &self.dict2lm,
            };
            for tree in self.trees.iter_mut().chain(&mut self.filler_trees) {
                tree.propagate_leaves(wth, |wid, score, hist, rc| {
                    vh.rescore(&ctx, wid, frame, score, hist, rc);
                });
            }
        }
        self.vh.prune(
            &self.dict,
            frame,
            self.max_words_per_frame,
            self.max_hist_per_frame,
            wb,
        );
        stats.word_exits += self.vh.frame_range(frame).len() as u64;

        self.word_transitions(frame, best + self.hmm_beam);

        self.vh.frame_windup(frame);
        for tree in self.trees.iter_mut().chain(&mut self.filler_trees) {
            tree.swap_active();
        }
        self.frame += 1;
        Ok(stats)
    }

    fn finish(&mut self, scorer: &mut AcousticScorer) -> Result<()> {
        let ctx_exit = {
            let lm = self.lm.clone();
            let ctx = LmContext {
                lm: &*lm,
                dict: &self.dict,
                d2p: &self.d2p,
                fillpen: &self.fillpen,
                dict2lm: &self.dict2lm,
            };
            self.vh.final_result(&ctx)
        };
        let exit = ctx_exit?;

        let second = if self.flat_rescore {
            self.run_flat_pass(scorer)?
        } else {
            None
        };
        self.result = match second {
            Some((vh, exit2)) => {
                info!("second pass result supersedes the tree pass");
                Some((vh, exit2))
            }
            None => Some((std::mem::replace(&mut self.vh, ViterbiHistory::new(self.word_beam)), exit)),
        };

        for tree in self.trees.iter_mut().chain(&mut self.filler_trees) {
            tree.utt_end();
        }
        Ok(())
    }

    fn reinit(&mut self) -> Result<()> {
        self.result = None;
        self.lattice = None;
        self.vh.utt_reset();
        Ok(())
    }

    fn hypothesis(&mut self) -> Option<Hypothesis> {
        let (vh, exit) = self.result.as_ref()?;
        let score = vh.entry(*exit).score;
        let words: Vec<&str> = vh
            .backtrace(*exit)
            .into_iter()
            .map(|id| vh.entry(id))
            .filter(|e| !self.dict.is_filler(e.wid))
            .map(|e| self.dict.text(self.dict.base_wid(e.wid)))
            .collect();
        Some(Hypothesis {
            text: words.join(" "),
            score,
        })
    }

    fn partial_hypothesis(&mut self) -> Option<Hypothesis> {
        let best = self.vh.partial_result(self.frame)?;
        let score = self.vh.entry(best).score;
        let words: Vec<&str> = self
            .vh
            .backtrace(best)
            .into_iter()
            .map(|id| self.vh.entry(id))
            .filter(|e| !self.dict.is_filler(e.wid))
            .map(|e| self.dict.text(self.dict.base_wid(e.wid)))
            .collect();
        Some(Hypothesis {
            text: words.join(" "),
            score,
        })
    }

    fn segments(&mut self) -> Vec<Segment> {
        let mut segments = match self.result_backtrace() {
            Some(s) => s,
            None => return Vec::new(),
        };
        // Attach link posteriors when the lattice has them.
        if let Some(lat) = self.lattice.as_ref() {
            for seg in &mut segments {
                for n in 0..lat.n_nodes() as u32 {
                    let node = lat.node(n);
                    if node.wid == seg.wid && node.sf == seg.sf {
                        for (l, link) in lat.live_links(&node.in_links) {
                            if link.ef == seg.ef {
                                seg.post = Some(lat.posterior(l));
                            }
                        }
                    }
                }
            }
        }
        segments
    }

    fn lattice(&mut self) -> Option<Arc<Lattice>> {
        if self.lattice.is_none() {
            let (vh, exit) = self.result.as_ref()?;
            let mut lat = Lattice::build(self.dict.clone(), self.logmath.clone(), vh, *exit);
            lat.compute_posteriors();
            self.lattice = Some(Arc::new(lat));
        }
        self.lattice.clone()
    }

    fn posterior(&mut self) -> Option<Score> {
        // Reported-path score against the total lattice probability.
        let total = {
            let (vh, exit) = self.result.as_ref()?;
            vh.entry(*exit).score
        };
        let lat = self.lattice()?;
        let mut norm = None;
        for (_, link) in lat.live_links(&lat.node(lat.end()).in_links) {
            norm = Some(match norm {
                None => link.alpha,
                Some(n) => self.logmath.add(n, link.alpha),
            });
        }
        norm.map(|n| total - n)
    }
}
