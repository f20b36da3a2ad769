//! Backpointer table of word exits.
//!
//! Every word exit the search survives long enough to report lands here as
//! an entry carrying its word, time span, scores, predecessor and LM state.
//! Entries are append-only within an utterance and organised into per-frame
//! segments, so an id is stable for the whole utterance and the lattice can
//! be read straight out of the table afterwards.
//!
//! Within one frame at most one entry is kept per distinct LM state; the
//! per-right-context exit scores of competing entries merge into that
//! entry's slot vector, which is what makes cross-word triphone scoring
//! exact when the successor picks its slot.
use crate::dict::{Dictionary, WordId};
use crate::dict2pid::PhoneIdMap;
use crate::error::{DecodeError, Result};
use crate::hmm::{Frame, HistId, NO_HIST};
use crate::lm::{trigram_score, FillerPenalties, LanguageModel, LmWordId, NO_LM_WORD};
use crate::logmath::{Score, WORST_SCORE};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Exit score and predecessor of one right-context variant.
#[derive(Debug, Clone, Copy)]
pub struct RcScore {
    pub score: Score,
    pub pred: HistId,
}

impl RcScore {
    const NONE: RcScore = RcScore {
        score: WORST_SCORE,
        pred: NO_HIST,
    };
}

#[derive(Debug, Clone)]
pub struct HistEntry {
    pub wid: WordId,
    pub sf: Frame,
    pub ef: Frame,
    pub ascr: Score,
    pub lscr: Score,
    /// Accumulated path score through this exit.
    pub score: Score,
    pub pred: HistId,
    pub valid: bool,
    /// `[current, previous]` LM word ids of the path.
    pub lmstate: [LmWordId; 2],
    /// Per-right-context exit variants; empty when not tracked.
    pub rc: Vec<RcScore>,
}

impl HistEntry {
    /// Exit score towards a successor whose first CI phone maps to `slot`.
    pub fn rc_score(&self, slot: u16) -> Score {
        match self.rc.get(slot as usize) {
            Some(rc) if rc.score > WORST_SCORE => rc.score,
            _ => self.score,
        }
    }
}

/// Everything `rescore` needs from the rest of the session.
pub struct LmContext<'a> {
    pub lm: &'a dyn LanguageModel,
    pub dict: &'a Dictionary,
    pub d2p: &'a PhoneIdMap,
    pub fillpen: &'a FillerPenalties,
    /// Dictionary base word id -> LM word id (`NO_LM_WORD` when absent).
    pub dict2lm: &'a [LmWordId],
}

#[derive(Debug)]
pub struct ViterbiHistory {
    entries: Vec<HistEntry>,
    /// `frame_start[f]` is the index of frame `f`'s first entry; one extra
    /// element marks the end of the last wound-up frame.
    frame_start: Vec<usize>,
    n_frm: Frame,
    best_score: Vec<Score>,
    best_id: Vec<HistId>,
    /// LM-state dedup within the current frame.
    lmstate_map: HashMap<[LmWordId; 2], HistId>,
    word_beam: Score,
}

impl ViterbiHistory {
    pub fn new(word_beam: Score) -> Self {
        Self {
            entries: Vec::new(),
            frame_start: Vec::new(),
            n_frm: 0,
            best_score: Vec::new(),
            best_id: Vec::new(),
            lmstate_map: HashMap::new(),
            word_beam,
        }
    }

    /// Start an utterance with the sentinel `<s>` entry at frame -1.
    pub fn utt_begin(&mut self, start_wid: WordId, start_lm: LmWordId) {
        self.entries.clear();
        self.lmstate_map.clear();
        self.entries.push(HistEntry {
            wid: start_wid,
            sf: -1,
            ef: -1,
            ascr: 0,
            lscr: 0,
            score: 0,
            pred: NO_HIST,
            valid: true,
            lmstate: [start_lm, NO_LM_WORD],
            rc: Vec::new(),
        });
        self.n_frm = 0;
        self.frame_start = vec![1];
        self.best_score = vec![WORST_SCORE];
        self.best_id = vec![NO_HIST];
    }

    pub fn n_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn n_frames(&self) -> Frame {
        self.n_frm
    }

    pub fn entry(&self, id: HistId) -> &HistEntry {
        &self.entries[id as usize]
    }

    pub fn entries(&self) -> &[HistEntry] {
        &self.entries
    }

    /// Entry ids belonging to frame `f`. Valid for wound-up frames and, for
    /// the current frame, everything appended so far.
    pub fn frame_range(&self, f: Frame) -> std::ops::Range<usize> {
        let start = self.frame_start[f as usize];
        let end = if (f as usize + 1) < self.frame_start.len() {
            self.frame_start[f as usize + 1]
        } else {
            self.entries.len()
        };
        start..end
    }

    pub fn best_exit(&self, f: Frame) -> (HistId, Score) {
        (self.best_id[f as usize], self.best_score[f as usize])
    }

    /// Merge a candidate exit into the current frame, deduplicating on LM
    /// state. The right-context slot always merges; the entry core is
    /// replaced only by a better total score.
    fn enter(&mut self, cand: HistEntry, rc_slot: u16, n_rc: usize) {
        let cand_score = cand.score;
        let cand_pred = cand.pred;
        let id = match self.lmstate_map.get(&cand.lmstate) {
            None => {
                let id = self.entries.len() as HistId;
                let mut cand = cand;
                cand.rc = vec![RcScore::NONE; n_rc];
                self.lmstate_map.insert(cand.lmstate, id);
                self.entries.push(cand);
                id
            }
            Some(&id) => {
                let e = &mut self.entries[id as usize];
                if cand.score > e.score {
                    let rc = std::mem::take(&mut e.rc);
                    *e = cand;
                    e.rc = rc;
                }
                id
            }
        };
        let e = &mut self.entries[id as usize];
        if let Some(slot) = e.rc.get_mut(rc_slot as usize) {
            if cand_score > slot.score {
                *slot = RcScore {
                    score: cand_score,
                    pred: cand_pred,
                };
            }
        }
        let f = self.n_frm as usize;
        if self.best_score[f] < cand_score {
            self.best_score[f] = cand_score;
            self.best_id[f] = id;
        }
    }

    /// Turn a raw word exit into history entries: one per surviving
    /// predecessor LM state, each rescored with the full n-gram (or the
    /// filler penalty, which leaves the LM state untouched).
    pub fn rescore(
        &mut self,
        ctx: &LmContext<'_>,
        wid: WordId,
        ef: Frame,
        score: Score,
        pred: HistId,
        rc_slot: u16,
    ) {
        assert_eq!(self.n_frm, ef, "rescore out of frame order");
        assert!(pred >= 0, "word exit without a predecessor");

        let pve = &self.entries[pred as usize];
        let sf = pve.ef + 1;
        let ascr = score - pve.score;
        let pred_ef = pve.ef;
        let pred_wid = pve.wid;
        let pred_lmstate = pve.lmstate;
        // The right-context slots were assigned when this word's final phone
        // expanded under the left context of the path entering it; rebuild
        // the same context (filler phones stand in as silence, matching the
        // word transition) so the slot vector lines up.
        let mdef = ctx.dict.mdef();
        let mut lc = ctx.dict.last_phone(pred_wid);
        if mdef.is_filler_phone(lc) {
            lc = mdef.silence_phone();
        }
        let n_rc = ctx.d2p.rc_count(ctx.dict, wid, lc);

        if ctx.dict.is_filler(wid) {
            let lscr = ctx.fillpen.penalty(wid);
            let total = score + lscr;
            if total - self.word_beam >= self.best_score[self.n_frm as usize] {
                self.enter(
                    HistEntry {
                        wid,
                        sf,
                        ef,
                        ascr,
                        lscr,
                        score: total,
                        pred,
                        valid: true,
                        lmstate: pred_lmstate,
                        rc: Vec::new(),
                    },
                    rc_slot,
                    n_rc,
                );
            }
            return;
        }

        let lwid = ctx.dict2lm[ctx.dict.base_wid(wid) as usize];
        // Re-examine every surviving exit in the predecessor's frame: each
        // distinct LM state is a different path once the n-gram weighs in.
        // This scan is quadratic in exits per frame; pruning keeps it sane.
        let range = if pred == 0 {
            0..1
        } else {
            self.frame_range(pred_ef)
        };
        for i in range {
            let (p_valid, p_score, p_lmstate) = {
                let p = &self.entries[i];
                (p.valid, p.score, p.lmstate)
            };
            if !p_valid {
                continue;
            }
            let base = p_score + ascr;
            if base - self.word_beam < self.best_score[self.n_frm as usize] {
                continue;
            }
            let lscr = trigram_score(ctx.lm, lwid, p_lmstate[0], p_lmstate[1]);
            let total = base + lscr;
            if total - self.word_beam >= self.best_score[self.n_frm as usize] {
                self.enter(
                    HistEntry {
                        wid,
                        sf,
                        ef,
                        ascr,
                        lscr,
                        score: total,
                        pred: i as HistId,
                        valid: true,
                        lmstate: [lwid, p_lmstate[0]],
                        rc: Vec::new(),
                    },
                    rc_slot,
                    n_rc,
                );
            }
        }
    }

    /// Beam-and-histogram pruning of the current frame's entries, followed
    /// by compaction. Keeps at most `max_words` distinct base words and
    /// `max_hist` entries, and a single filler exit.
    pub fn prune(
        &mut self,
        dict: &Dictionary,
        frame: Frame,
        max_words: usize,
        max_hist: usize,
        beam: Score,
    ) {
        let range = self.frame_range(frame);
        if range.is_empty() {
            return;
        }
        let th = self.best_score[frame as usize] + beam;

        let mut order: Vec<usize> = range.clone().collect();
        order.sort_unstable_by_key(|&i| std::cmp::Reverse(self.entries[i].score));

        for i in range.clone() {
            self.entries[i].valid = false;
        }
        let mut kept_words: Vec<WordId> = Vec::new();
        let mut filler_done = false;
        let mut n_kept = 0usize;
        for &i in &order {
            if self.entries[i].score < th || n_kept >= max_hist {
                break;
            }
            let wid = self.entries[i].wid;
            if dict.is_filler(wid) {
                if filler_done {
                    continue;
                }
                filler_done = true;
            }
            let base = dict.base_wid(wid);
            if !kept_words.contains(&base) {
                if kept_words.len() < max_words {
                    kept_words.push(base);
                    n_kept += 1;
                    self.entries[i].valid = true;
                }
            } else {
                n_kept += 1;
                self.entries[i].valid = true;
            }
        }

        // Compact the frame slice; ids of earlier frames are untouched.
        let start = range.start;
        let tail = self.entries.split_off(start);
        let before = tail.len();
        self.entries.extend(tail.into_iter().filter(|e| e.valid));
        let removed = before - (self.entries.len() - start);
        if removed > 0 {
            debug!(frame, removed, kept = n_kept, "history pruned");
        }
        self.lmstate_map.clear();

        let f = frame as usize;
        self.best_score[f] = WORST_SCORE;
        self.best_id[f] = NO_HIST;
        for i in start..self.entries.len() {
            if self.entries[i].score > self.best_score[f] {
                self.best_score[f] = self.entries[i].score;
                self.best_id[f] = i as HistId;
            }
        }
    }

    /// Close the current frame and open the next.
    pub fn frame_windup(&mut self, frame: Frame) {
        assert_eq!(self.n_frm, frame, "windup out of frame order");
        self.n_frm += 1;
        self.frame_start.push(self.entries.len());
        self.lmstate_map.clear();
        self.best_score.push(WORST_SCORE);
        self.best_id.push(NO_HIST);
    }

    /// Best entry with `ef <= frame`, for mid-utterance results. No `</s>`
    /// is appended or scored.
    pub fn partial_result(&self, frame: Frame) -> Option<HistId> {
        let mut best = None;
        let mut best_score = WORST_SCORE;
        for (i, e) in self.entries.iter().enumerate().skip(1) {
            if e.valid && e.ef <= frame && e.score > best_score {
                best_score = e.score;
                best = Some(i as HistId);
            }
        }
        best
    }

    /// Finish the utterance: find the best exit in the last non-empty frame,
    /// bridge a silence over any trailing empty frames, rescore the `</s>`
    /// transition and append it. Returns the exit entry's id.
    pub fn final_result(&mut self, ctx: &LmContext<'_>) -> Result<HistId> {
        if self.n_frm == 0 {
            return Err(DecodeError::EmptyUtterance);
        }
        let mut f = self.n_frm - 1;
        while f >= 0 && self.frame_range(f).is_empty() {
            f -= 1;
        }
        if f < 0 {
            return Err(DecodeError::EmptyUtterance);
        }

        if f != self.n_frm - 1 {
            // Trailing frames produced no exits; bridge with a silence so
            // the utterance still ends cleanly.
            warn!(
                last_exit_frame = f,
                n_frames = self.n_frm,
                "no word exits at the end of the utterance, bridging with silence"
            );
            let (best_id, best_score) = self.best_in_frame(f, ctx);
            let pve = &self.entries[best_id as usize];
            let sil = ctx.dict.silence_wid();
            let lscr = ctx.fillpen.penalty(sil);
            let bridge = HistEntry {
                wid: sil,
                sf: pve.ef + 1,
                ef: self.n_frm - 1,
                ascr: 0,
                lscr,
                score: pve.score + lscr,
                pred: best_id,
                valid: true,
                lmstate: pve.lmstate,
                rc: Vec::new(),
            };
            let score = bridge.score;
            self.entries.push(bridge);
            let last = self.frame_start.len() - 1;
            self.frame_start[last] = self.entries.len();
            let lf = (self.n_frm - 1) as usize;
            self.best_score[lf] = score;
            self.best_id[lf] = self.entries.len() as HistId - 1;
            f = self.n_frm - 1;
        }

        let (best_id, best_score) = self.best_in_frame(f, ctx);
        let pve = &self.entries[best_id as usize];
        let finish_lm = ctx.lm.finish_id();
        let exit = HistEntry {
            wid: ctx.dict.finish_wid(),
            sf: if pve.ef < 0 { 0 } else { pve.ef + 1 },
            ef: self.n_frm,
            ascr: 0,
            lscr: best_score - pve.score,
            score: best_score,
            pred: best_id,
            valid: true,
            lmstate: [finish_lm, finish_lm],
            rc: Vec::new(),
        };
        self.entries.push(exit);
        Ok(self.entries.len() as HistId - 1)
    }

    /// Best entry of frame `f` under the implicit `</s>` transition.
    fn best_in_frame(&self, f: Frame, ctx: &LmContext<'_>) -> (HistId, Score) {
        let finish_lm = ctx.lm.finish_id();
        let mut best_id = NO_HIST;
        let mut best = WORST_SCORE;
        for i in self.frame_range(f) {
            let e = &self.entries[i];
            if !e.valid {
                continue;
            }
            let s = e.score + trigram_score(ctx.lm, finish_lm, e.lmstate[0], e.lmstate[1]);
            if s > best {
                best = s;
                best_id = i as HistId;
            }
        }
        assert!(best_id >= 0);
        (best_id, best)
    }

    /// Path of entry ids from the sentinel (exclusive) to `exit`.
    pub fn backtrace(&self, exit: HistId) -> Vec<HistId> {
        let mut path = Vec::new();
        let mut id = exit;
        while id > 0 {
            path.push(id);
            id = self.entries[id as usize].pred;
        }
        path.reverse();
        path
    }

    pub fn utt_reset(&mut self) {
        self.entries.clear();
        self.frame_start.clear();
        self.best_score.clear();
        self.best_id.clear();
        self.lmstate_map.clear();
        self.n_frm = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::tests::toy_mdef;
    use crate::lm::TableLmBuilder;
    use crate::logmath::LogMath;
    use std::io;
    use std::sync::Arc;

    struct World {
        dict: Arc<Dictionary>,
        d2p: Arc<PhoneIdMap>,
        lm: Arc<crate::lm::TableLm>,
        fillpen: FillerPenalties,
        dict2lm: Vec<LmWordId>,
    }

    fn world() -> World {
        let lmath = LogMath::new(1.0001).unwrap();
        let mdef = toy_mdef();
        let main = io::Cursor::new("FIVE F AY V\nBYE B AY\n");
        let dict = Arc::new(
            Dictionary::from_readers(mdef.clone(), main, None::<io::Empty>).unwrap(),
        );
        let d2p = PhoneIdMap::build(mdef, &dict);
        let mut b = TableLmBuilder::new(lmath.clone(), 1.0, 1.0);
        b.unigram("FIVE", 0.4, 1.0)
            .unigram("BYE", 0.4, 1.0)
            .bigram("FIVE", "BYE", 0.5, 1.0)
            .bigram("<s>", "FIVE", 0.6, 1.0);
        let lm = b.build();
        let fillpen = FillerPenalties::new(&lmath, &dict, 0.1, 0.05, 1.0);
        let dict2lm = (0..dict.len() as WordId)
            .map(|w| {
                lm.word_id(dict.text(w)).unwrap_or(NO_LM_WORD)
            })
            .collect();
        World {
            dict,
            d2p,
            lm,
            fillpen,
            dict2lm,
        }
    }

    impl World {
        fn ctx(&self) -> LmContext<'_> {
            LmContext {
                lm: &*self.lm,
                dict: &self.dict,
                d2p: &self.d2p,
                fillpen: &self.fillpen,
                dict2lm: &self.dict2lm,
            }
        }
    }

    fn begin(w: &World) -> ViterbiHistory {
        let mut vh = ViterbiHistory::new(-200_000);
        vh.utt_begin(w.dict.start_wid(), w.lm.start_id());
        vh
    }

    #[test]
    fn rescore_builds_valid_history() {
        let w = world();
        let mut vh = begin(&w);
        let five = w.dict.word_id("FIVE").unwrap();
        let bye = w.dict.word_id("BYE").unwrap();

        // FIVE exits at frame 0 off the sentinel.
        vh.rescore(&w.ctx(), five, 0, -1000, 0, 0);
        assert_eq!(vh.frame_range(0).len(), 1);
        vh.frame_windup(0);
        // BYE exits at frame 1 with the FIVE entry as predecessor.
        let pred = vh.frame_range(0).start as HistId;
        vh.rescore(&w.ctx(), bye, 1, vh.entry(pred).score - 500, pred, 0);
        vh.frame_windup(1);

        let exit = vh.final_result(&w.ctx()).unwrap();
        let path = vh.backtrace(exit);
        let words: Vec<&str> = path.iter().map(|&id| w.dict.text(vh.entry(id).wid)).collect();
        assert_eq!(words, vec!["FIVE", "BYE", "</s>"]);
        // History integrity: predecessors end before successors start.
        for &id in &path {
            let e = vh.entry(id);
            if e.pred >= 0 {
                assert!(vh.entry(e.pred).ef < e.sf);
            }
            assert!(e.sf <= e.ef);
        }
    }

    #[test]
    fn lmstate_dedup_keeps_best() {
        let w = world();
        let mut vh = begin(&w);
        let five = w.dict.word_id("FIVE").unwrap();
        vh.rescore(&w.ctx(), five, 0, -2000, 0, 0);
        vh.rescore(&w.ctx(), five, 0, -1000, 0, 0);
        // Same LM state twice in one frame: one entry, best total score,
        // best right-context slot, and the fallback for unseen slots.
        assert_eq!(vh.frame_range(0).len(), 1);
        let e = vh.entry(vh.frame_range(0).start as HistId);
        assert_eq!(e.rc_score(0), e.score);
        assert_eq!(e.rc_score(200), e.score);
        assert_eq!(e.ascr, -1000);
    }

    #[test]
    fn filler_keeps_lm_state_and_pays_penalty() {
        let w = world();
        let mut vh = begin(&w);
        let sil = w.dict.silence_wid();
        vh.rescore(&w.ctx(), sil, 0, -100, 0, 0);
        let e = vh.entry(1);
        assert_eq!(e.lmstate, vh.entry(0).lmstate);
        assert_eq!(e.lscr, w.fillpen.penalty(sil));
    }

    #[test]
    fn prune_keeps_word_budget_and_one_filler() {
        let w = world();
        let mut vh = begin(&w);
        let five = w.dict.word_id("FIVE").unwrap();
        let bye = w.dict.word_id("BYE").unwrap();
        let sil = w.dict.silence_wid();
        let noise = w.dict.word_id("<sil>").unwrap();
        assert_eq!(sil, noise);
        vh.rescore(&w.ctx(), five, 0, -1000, 0, 0);
        vh.rescore(&w.ctx(), bye, 0, -1500, 0, 0);
        vh.rescore(&w.ctx(), sil, 0, -1200, 0, 0);
        let before = vh.frame_range(0).len();
        assert_eq!(before, 3);

        vh.prune(&w.dict, 0, 1, 10, -10_000_000);
        // Only the best word survives the word budget; the filler survives
        // separately at most once.
        let kept: Vec<WordId> = vh
            .frame_range(0)
            .map(|i| vh.entry(i as HistId).wid)
            .collect();
        assert!(kept.contains(&five));
        assert!(!kept.contains(&bye));
        vh.frame_windup(0);
    }

    #[test]
    fn empty_utterance_reported() {
        let w = world();
        let mut vh = begin(&w);
        vh.frame_windup(0);
        vh.frame_windup(1);
        assert!(matches!(
            vh.final_result(&w.ctx()),
            Err(DecodeError::EmptyUtterance)
        ));
    }

    #[test]
    fn silence_bridges_trailing_empty_frames() {
        let w = world();
        let mut vh = begin(&w);
        let five = w.dict.word_id("FIVE").unwrap();
        vh.rescore(&w.ctx(), five, 0, -1000, 0, 0);
        vh.frame_windup(0);
        vh.frame_windup(1);
        vh.frame_windup(2);
        let exit = vh.final_result(&w.ctx()).unwrap();
        let path = vh.backtrace(exit);
        let words: Vec<&str> = path.iter().map(|&id| w.dict.text(vh.entry(id).wid)).collect();
        assert_eq!(words, vec!["FIVE", "<sil>", "</s>"]);
        // The bridge spans to the final frame.
        let bridge = vh.entry(path[1]);
        assert_eq!(bridge.ef, 2);
    }
}
