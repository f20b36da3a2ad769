//! Second-pass flat-lexicon rescoring.
//!
//! The first pass trades LM accuracy for sharing: inside the tree a path
//! only sees the look-ahead score until it reaches a leaf. This pass takes
//! the words the first pass actually recorded, gives each its own explicit
//! HMM chain (no sharing, one final-phone variant per distinct right
//! context) and reruns the frame-synchronous Viterbi with full n-gram
//! scores, only allowing a word to exit near a frame where the first pass
//! saw it exit. The result is a fresh history table whose lattice supersedes
//! the first-pass one.
use crate::dict::{Dictionary, WordId};
use crate::dict2pid::PhoneIdMap;
use crate::error::Result;
use crate::hmm::{Frame, HistId, Hmm, HmmContext};
use crate::lm::LmWordId;
use crate::logmath::{Score, WORST_SCORE};
use crate::search::StepStats;
use crate::senone::SenoneMask;
use crate::vithist::{LmContext, ViterbiHistory};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

struct FlatWord {
    wid: WordId,
    /// Every phone except the last, as one linear chain.
    chain: Vec<Hmm>,
    /// Last phone, one HMM per compressed right context.
    finals: Vec<Hmm>,
}

pub struct FlatRescore {
    dict: Arc<Dictionary>,
    d2p: Arc<PhoneIdMap>,
    words: Vec<FlatWord>,
    /// `(word, frame)` exits the first pass vouched for.
    allowed: HashSet<(WordId, Frame)>,
    vh: ViterbiHistory,
    hmm_beam: Score,
    word_beam: Score,
    max_words_per_frame: usize,
    max_hist_per_frame: usize,
}

impl FlatRescore {
    /// Build the flat lexicon from the words present in the first pass's
    /// history, with `window` frames of slack around their exit frames.
    pub fn new(
        dict: Arc<Dictionary>,
        d2p: Arc<PhoneIdMap>,
        first_pass: &ViterbiHistory,
        window: i32,
        hmm_beam: Score,
        word_beam: Score,
        max_words_per_frame: usize,
        max_hist_per_frame: usize,
    ) -> Self {
        let mdef = dict.mdef().clone();
        let sil = mdef.silence_phone();
        let mut allowed = HashSet::new();
        let mut word_set: Vec<WordId> = Vec::new();
        for e in first_pass.entries().iter().skip(1) {
            if !e.valid || e.wid == dict.finish_wid() || e.wid == dict.start_wid() {
                continue;
            }
            for d in -window..=window {
                allowed.insert((e.wid, e.ef + d));
            }
            if !word_set.contains(&e.wid) {
                word_set.push(e.wid);
            }
        }

        let mut words = Vec::with_capacity(word_set.len());
        for wid in word_set {
            let pron = dict.pronunciation(wid).to_vec();
            let mut chain = Vec::new();
            let finals;
            if pron.len() == 1 {
                let ci = pron[0];
                let variants = if dict.is_filler(wid) {
                    vec![mdef.ci_sseq(ci)]
                } else {
                    d2p.lrssid(ci, sil).sseq.clone()
                };
                finals = variants
                    .iter()
                    .map(|&s| Hmm::new(s, mdef.ci_tmat(ci)))
                    .collect();
            } else {
                // Left context of the first phone is approximated with
                // silence; the right contexts of the last phone are exact.
                let first = d2p.ldiph(pron[0], pron[1], sil);
                chain.push(Hmm::new(first, mdef.ci_tmat(pron[0])));
                for p in 1..pron.len() - 1 {
                    chain.push(Hmm::new(
                        d2p.internal_sseq(wid, p),
                        mdef.ci_tmat(pron[p]),
                    ));
                }
                let last = *pron.last().unwrap();
                let lc = pron[pron.len() - 2];
                let variants = if dict.is_filler(wid) {
                    vec![mdef.ci_sseq(last)]
                } else {
                    d2p.rssid(last, lc).sseq.clone()
                };
                finals = variants
                    .iter()
                    .map(|&s| Hmm::new(s, mdef.ci_tmat(last)))
                    .collect();
            }
            words.push(FlatWord { wid, chain, finals });
        }
        info!(words = words.len(), "flat lexicon built for rescoring");
        Self {
            dict,
            d2p,
            words,
            allowed,
            vh: ViterbiHistory::new(word_beam),
            hmm_beam,
            word_beam,
            max_words_per_frame,
            max_hist_per_frame,
        }
    }

    pub fn start(&mut self, start_lm: LmWordId) {
        self.vh.utt_begin(self.dict.start_wid(), start_lm);
        for w in 0..self.words.len() {
            self.enter_word(w, 0, 0, 0);
        }
    }

    fn enter_word(&mut self, w: usize, score: Score, hist: HistId, frame: Frame) {
        let word = &mut self.words[w];
        match word.chain.first_mut() {
            Some(h) => {
                h.enter(score, hist, frame);
            }
            None => {
                for h in &mut word.finals {
                    h.enter(score, hist, frame);
                }
            }
        }
    }

    pub fn active_senones(&self, frame: Frame, mask: &mut SenoneMask) {
        let mdef = self.dict.mdef();
        for word in &self.words {
            for h in word.chain.iter().chain(&word.finals) {
                if h.is_active(frame) {
                    for &sen in mdef.sseq_senones(h.sseq) {
                        mask.set(sen);
                    }
                }
            }
        }
    }

    pub fn step(
        &mut self,
        ctx: &HmmContext,
        lm_ctx: &LmContext<'_>,
        frame: Frame,
        senscr: &[Score],
    ) -> Result<StepStats> {
        let nf = frame + 1;
        let mut stats = StepStats::default();
        let mut best = WORST_SCORE;
        let mut wbest = WORST_SCORE;
        for word in &mut self.words {
            for h in word.chain.iter_mut() {
                if h.is_active(frame) {
                    let k = ctx.eval(h, senscr);
                    stats.hmm_evals += 1;
                    best = best.max(k);
                }
            }
            for h in word.finals.iter_mut() {
                if h.is_active(frame) {
                    let k = ctx.eval(h, senscr);
                    stats.hmm_evals += 1;
                    best = best.max(k);
                    wbest = wbest.max(k);
                }
            }
        }
        let th = best + self.hmm_beam;
        let wth = wbest + self.word_beam;

        // Keep-or-retire plus within-word propagation.
        for word in &mut self.words {
            let n_chain = word.chain.len();
            for i in 0..n_chain + word.finals.len() {
                let h = if i < n_chain {
                    &mut word.chain[i]
                } else {
                    &mut word.finals[i - n_chain]
                };
                if !h.is_active(frame) {
                    continue;
                }
                if h.frame < nf {
                    if h.best_score >= th {
                        h.frame = nf;
                    } else {
                        h.clear();
                        continue;
                    }
                }
            }
            for i in 0..n_chain {
                let (out, hist) = (word.chain[i].out_score, word.chain[i].out_history);
                if out < th || hist < 0 {
                    continue;
                }
                if i + 1 < n_chain {
                    word.chain[i + 1].enter(out, hist, nf);
                } else {
                    for h in &mut word.finals {
                        h.enter(out, hist, nf);
                    }
                }
            }
        }

        // Word exits, restricted to the first pass's candidate frames.
        for w in 0..self.words.len() {
            let wid = self.words[w].wid;
            if !self.allowed.contains(&(wid, frame)) {
                continue;
            }
            for rc in 0..self.words[w].finals.len() {
                let h = &self.words[w].finals[rc];
                if !h.is_active(frame) || h.out_score < wth || h.out_history < 0 {
                    continue;
                }
                self.vh
                    .rescore(lm_ctx, wid, frame, h.out_score, h.out_history, rc as u16);
            }
        }
        self.vh.prune(
            &self.dict,
            frame,
            self.max_words_per_frame,
            self.max_hist_per_frame,
            self.word_beam,
        );

        // Exits feed every word's entry, through the right-context slot
        // matching the successor's first phone.
        let range = self.vh.frame_range(frame);
        stats.word_exits += range.len() as u64;
        let (_, best_exit) = self.vh.best_exit(frame);
        if best_exit > WORST_SCORE {
            let entry_th = best_exit + self.word_beam;
            let exits: Vec<HistId> = range.map(|i| i as HistId).collect();
            for e_id in exits {
                let (e_wid, e_score) = {
                    let e = self.vh.entry(e_id);
                    (e.wid, e.score)
                };
                if e_score < entry_th {
                    continue;
                }
                // A single-phone word's fan-out was built on the silence
                // left-context row (the flat lexicon's approximation), so
                // its slots are read back through the same row.
                let sil = self.dict.mdef().silence_phone();
                let rc_map = self.d2p.rc_map(&self.dict, e_wid, sil).to_vec();
                for w in 0..self.words.len() {
                    let first_ci = self.dict.first_phone(self.words[w].wid) as usize;
                    let slot = rc_map.get(first_ci).copied().unwrap_or(0);
                    let in_score = self.vh.entry(e_id).rc_score(slot);
                    if in_score >= entry_th {
                        self.enter_word(w, in_score, e_id, nf);
                    }
                }
            }
        }
        self.vh.frame_windup(frame);
        Ok(stats)
    }

    /// Close the pass and hand back the rescored history and its exit.
    pub fn finish(mut self, lm_ctx: &LmContext<'_>) -> Result<(ViterbiHistory, HistId)> {
        let exit = self.vh.final_result(lm_ctx)?;
        debug!(entries = self.vh.n_entries(), "flat rescoring finished");
        Ok((self.vh, exit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::tests::toy_mdef;
    use crate::lm::{FillerPenalties, LanguageModel, TableLmBuilder, NO_LM_WORD};
    use crate::logmath::LogMath;
    use std::io;

    #[test]
    fn flat_lexicon_covers_first_pass_words() {
        let lmath = LogMath::new(1.0001).unwrap();
        let mdef = toy_mdef();
        let main = io::Cursor::new("FIVE F AY V\nBAY B AY\nA AH\n");
        let dict = Arc::new(
            Dictionary::from_readers(mdef.clone(), main, None::<io::Empty>).unwrap(),
        );
        let d2p = PhoneIdMap::build(mdef, &dict);
        let mut b = TableLmBuilder::new(lmath.clone(), 1.0, 1.0);
        b.unigram("FIVE", 0.5, 1.0).unigram("A", 0.5, 1.0);
        let lm = b.build();
        let fillpen = FillerPenalties::new(&lmath, &dict, 0.1, 0.05, 1.0);
        let dict2lm: Vec<_> = (0..dict.len() as WordId)
            .map(|w| lm.word_id(dict.text(w)).unwrap_or(NO_LM_WORD))
            .collect();
        let ctx = LmContext {
            lm: &*lm,
            dict: &dict,
            d2p: &d2p,
            fillpen: &fillpen,
            dict2lm: &dict2lm,
        };

        // First pass recorded FIVE at frame 7 and A at frame 3.
        let five = dict.word_id("FIVE").unwrap();
        let a = dict.word_id("A").unwrap();
        let mut vh1 = ViterbiHistory::new(-1_000_000);
        vh1.utt_begin(dict.start_wid(), lm.start_id());
        for f in 0..3 {
            vh1.frame_windup(f);
        }
        vh1.rescore(&ctx, a, 3, -300, 0, 0);
        vh1.frame_windup(3);
        for f in 4..7 {
            vh1.frame_windup(f);
        }
        let pred = vh1.frame_range(3).start as HistId;
        vh1.rescore(&ctx, five, 7, vh1.entry(pred).score - 400, pred, 0);
        vh1.frame_windup(7);

        let flat = FlatRescore::new(
            dict.clone(),
            d2p.clone(),
            &vh1,
            1,
            -100_000,
            -100_000,
            20,
            100,
        );
        // BAY never exited, so it is not in the flat lexicon.
        assert_eq!(flat.words.len(), 2);
        let a_word = flat.words.iter().find(|w| w.wid == a).unwrap();
        assert!(a_word.chain.is_empty());
        assert_eq!(a_word.finals.len(), 1);
        let five_word = flat.words.iter().find(|w| w.wid == five).unwrap();
        assert_eq!(five_word.chain.len(), 2);
        // Exit slack of one frame on either side.
        assert!(flat.allowed.contains(&(five, 6)));
        assert!(flat.allowed.contains(&(five, 8)));
        assert!(!flat.allowed.contains(&(five, 5)));
    }
}
