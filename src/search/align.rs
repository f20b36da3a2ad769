//! Forced alignment: a fixed word sequence, expanded to triphones and
//! states, walked frame by frame for its single best time assignment.
//!
//! The skeleton is the three-level structure the caller reads back: words
//! own phones, phones own states, and after a successful pass every level
//! carries contiguous start/duration spans that sum up to their parent's.
//! The search itself is a linear chain of HMMs with tokens flowing strictly
//! left to right; per frame and state it records which predecessor won, so
//! the backtrace can replay the exact state occupancy without keeping any
//! scores around.
use crate::acmod::AcousticScorer;
use crate::dict::{Dictionary, WordId};
use crate::dict2pid::PhoneIdMap;
use crate::error::{DecodeError, Result};
use crate::hmm::{Frame, HmmContext, MAX_EMIT_STATES};
use crate::lattice::Lattice;
use crate::logmath::{Score, WORST_SCORE};
use crate::mdef::{CiPhoneId, SenId, SseqId, TmatId};
use crate::search::{Hypothesis, Search, Segment, StepStats};
use crate::senone::SenoneMask;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct WordEntry {
    pub wid: WordId,
    pub start: Frame,
    pub duration: i32,
    pub score: Score,
    pub first_phone: usize,
    pub n_phones: usize,
}

#[derive(Debug, Clone)]
pub struct PhoneEntry {
    pub ci: CiPhoneId,
    pub sseq: SseqId,
    pub tmat: TmatId,
    pub start: Frame,
    pub duration: i32,
    pub score: Score,
    pub word: usize,
    pub first_state: usize,
    pub n_states: usize,
}

#[derive(Debug, Clone)]
pub struct StateEntry {
    pub sen: SenId,
    pub start: Frame,
    pub duration: i32,
    pub score: Score,
    pub phone: usize,
}

/// Word/phone/state alignment skeleton and, after the search, its filled-in
/// time spans.
#[derive(Debug, Clone)]
pub struct Alignment {
    dict: Arc<Dictionary>,
    d2p: Arc<PhoneIdMap>,
    words: Vec<WordEntry>,
    phones: Vec<PhoneEntry>,
    states: Vec<StateEntry>,
    total_score: Option<Score>,
}

impl Alignment {
    pub fn new(dict: Arc<Dictionary>, d2p: Arc<PhoneIdMap>) -> Self {
        Self {
            dict,
            d2p,
            words: Vec::new(),
            phones: Vec::new(),
            states: Vec::new(),
            total_score: None,
        }
    }

    /// Build a skeleton straight from a transcript.
    pub fn from_transcript(
        dict: Arc<Dictionary>,
        d2p: Arc<PhoneIdMap>,
        transcript: &str,
    ) -> Result<Self> {
        let mut al = Self::new(dict.clone(), d2p);
        for token in transcript.split_whitespace() {
            let wid = dict
                .word_id(token)
                .ok_or_else(|| DecodeError::Config(format!("word {token} not in dictionary")))?;
            al.add_word(wid);
        }
        if al.words.is_empty() {
            return Err(DecodeError::Config("empty transcript".into()));
        }
        al.populate();
        Ok(al)
    }

    pub fn add_word(&mut self, wid: WordId) {
        self.words.push(WordEntry {
            wid,
            start: 0,
            duration: 0,
            score: 0,
            first_phone: 0,
            n_phones: 0,
        });
    }

    /// Expand the word level into triphones and states. Cross-word contexts
    /// come from the neighbouring words, silence at the utterance edges.
    pub fn populate(&mut self) {
        self.phones.clear();
        self.states.clear();
        let mdef = self.dict.mdef().clone();
        let sil = mdef.silence_phone();
        let n_words = self.words.len();
        for i in 0..n_words {
            let wid = self.words[i].wid;
            let pron = self.dict.pronunciation(wid).to_vec();
            let lc = if i > 0 {
                self.dict.last_phone(self.words[i - 1].wid)
            } else {
                sil
            };
            let rc = if i + 1 < n_words {
                self.dict.first_phone(self.words[i + 1].wid)
            } else {
                sil
            };
            self.words[i].first_phone = self.phones.len();
            self.words[i].n_phones = pron.len();
            for (p, &ci) in pron.iter().enumerate() {
                let sseq = if pron.len() == 1 {
                    self.d2p.lrdiph(ci, lc, rc)
                } else if p == 0 {
                    self.d2p.ldiph(ci, pron[1], lc)
                } else if p == pron.len() - 1 {
                    let xw = self.d2p.rssid(ci, pron[p - 1]);
                    xw.sseq[xw.ctx_map[rc as usize] as usize]
                } else {
                    self.d2p.internal_sseq(wid, p)
                };
                let first_state = self.states.len();
                for &sen in mdef.sseq_senones(sseq) {
                    self.states.push(StateEntry {
                        sen,
                        start: 0,
                        duration: 0,
                        score: 0,
                        phone: self.phones.len(),
                    });
                }
                self.phones.push(PhoneEntry {
                    ci,
                    sseq,
                    tmat: mdef.ci_tmat(ci),
                    start: 0,
                    duration: 0,
                    score: 0,
                    word: i,
                    first_state,
                    n_states: mdef.n_emit_state(),
                });
            }
        }
    }

    pub fn words(&self) -> &[WordEntry] {
        &self.words
    }

    pub fn phones(&self) -> &[PhoneEntry] {
        &self.phones
    }

    pub fn states(&self) -> &[StateEntry] {
        &self.states
    }

    pub fn total_score(&self) -> Option<Score> {
        self.total_score
    }
}

/// Per-frame Viterbi bookkeeping for one phone slot.
#[derive(Debug, Clone)]
struct PhoneSlot {
    sseq: SseqId,
    tmat: TmatId,
    score: [Score; MAX_EMIT_STATES],
}

/// What one frame of the walk remembers for the backtrace.
#[derive(Debug, Clone)]
struct FrameRec {
    /// Winning predecessor state per (phone, state).
    choice: Vec<[u8; MAX_EMIT_STATES]>,
    /// Winning exit predecessor state per phone.
    out_choice: Vec<u8>,
    /// Whether the phone's state 0 held a fresh entry from its predecessor
    /// phone when this frame was evaluated.
    entered: Vec<bool>,
    /// Cumulative path score per (phone, state), for segment scores.
    score: Vec<[Score; MAX_EMIT_STATES]>,
    out_score: Vec<Score>,
}

pub struct StateAlignSearch {
    name: String,
    alignment: Alignment,
    hmm_ctx: HmmContext,
    slots: Vec<PhoneSlot>,
    records: Vec<FrameRec>,
    pending_entered: Vec<bool>,
    mask: SenoneMask,
    frame: Frame,
    done: bool,
}

impl StateAlignSearch {
    pub fn new(name: &str, alignment: Alignment) -> Self {
        let mdef = alignment.dict.mdef().clone();
        let slots = alignment
            .phones
            .iter()
            .map(|p| PhoneSlot {
                sseq: p.sseq,
                tmat: p.tmat,
                score: [WORST_SCORE; MAX_EMIT_STATES],
            })
            .collect();
        let mask = SenoneMask::new(mdef.n_senone());
        Self {
            name: name.to_string(),
            hmm_ctx: HmmContext::new(mdef),
            slots,
            records: Vec::new(),
            pending_entered: Vec::new(),
            mask,
            frame: 0,
            done: false,
            alignment,
        }
    }

    fn backtrace(&mut self) -> Result<()> {
        let n_frames = self.frame;
        let n_phones = self.slots.len();
        if n_frames <= 0 {
            return Err(DecodeError::AlignmentImpossible);
        }
        let last = &self.records[n_frames as usize - 1];
        let exit = last.out_score[n_phones - 1];
        if exit <= WORST_SCORE {
            return Err(DecodeError::AlignmentImpossible);
        }

        // Replay the winning choices backwards into a per-frame (phone,
        // state) occupancy, with the cumulative score at each frame.
        let mut occupancy = vec![(0usize, 0usize, 0 as Score); n_frames as usize];
        let mut p = n_phones - 1;
        let mut s = last.out_choice[p] as usize;
        let mut f = n_frames - 1;
        loop {
            let rec = &self.records[f as usize];
            occupancy[f as usize] = (p, s, rec.score[p][s]);
            if f == 0 {
                break;
            }
            let q = rec.choice[p][s] as usize;
            if q == 0 && rec.entered[p] && p > 0 {
                p -= 1;
                f -= 1;
                s = self.records[f as usize].out_choice[p] as usize;
            } else {
                f -= 1;
                s = q;
            }
        }
        assert_eq!(p, 0, "alignment backtrace did not reach the first phone");

        // Fold the occupancy into state runs, then propagate spans upward.
        let al = &mut self.alignment;
        for st in &mut al.states {
            st.start = 0;
            st.duration = 0;
            st.score = 0;
        }
        let state_index = |al: &Alignment, p: usize, s: usize| al.phones[p].first_state + s;
        let mut run_start = 0usize;
        for f in 0..n_frames as usize {
            let here = (occupancy[f].0, occupancy[f].1);
            let next_differs = f + 1 == n_frames as usize
                || (occupancy[f + 1].0, occupancy[f + 1].1) != here;
            if next_differs {
                let idx = state_index(al, here.0, here.1);
                let before = if run_start == 0 {
                    0
                } else {
                    occupancy[run_start - 1].2
                };
                let st = &mut al.states[idx];
                st.start = run_start as Frame;
                st.duration = (f + 1 - run_start) as i32;
                st.score = occupancy[f].2 - before;
                run_start = f + 1;
            }
        }
        for i in 0..al.phones.len() {
            let (first, n) = (al.phones[i].first_state, al.phones[i].n_states);
            let states = &al.states[first..first + n];
            let occupied: Vec<&StateEntry> =
                states.iter().filter(|s| s.duration > 0).collect();
            let phone = &mut al.phones[i];
            if occupied.is_empty() {
                phone.duration = 0;
                continue;
            }
            phone.start = occupied.iter().map(|s| s.start).min().unwrap();
            phone.duration = occupied.iter().map(|s| s.duration).sum();
            phone.score = occupied.iter().map(|s| s.score).sum();
        }
        for i in 0..al.words.len() {
            let (first, n) = (al.words[i].first_phone, al.words[i].n_phones);
            let phones = &al.phones[first..first + n];
            let word = &mut al.words[i];
            word.start = phones
                .iter()
                .filter(|p| p.duration > 0)
                .map(|p| p.start)
                .min()
                .unwrap_or(0);
            word.duration = phones.iter().map(|p| p.duration).sum();
            word.score = phones.iter().map(|p| p.score).sum();
        }
        al.total_score = Some(exit);
        info!(
            frames = n_frames,
            score = exit,
            "alignment backtrace complete"
        );
        Ok(())
    }
}

impl Search for StateAlignSearch {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, _scorer: &mut AcousticScorer) -> Result<()> {
        for slot in &mut self.slots {
            slot.score = [WORST_SCORE; MAX_EMIT_STATES];
        }
        self.records.clear();
        self.frame = 0;
        self.done = false;
        self.alignment.total_score = None;
        self.slots[0].score[0] = 0;
        self.pending_entered = vec![false; self.slots.len()];
        self.pending_entered[0] = true;
        Ok(())
    }

    fn step(&mut self, scorer: &mut AcousticScorer, frame: Frame) -> Result<StepStats> {
        debug_assert_eq!(frame, self.frame);
        let n = self.hmm_ctx.n_emit();
        let mdef = self.hmm_ctx.mdef().clone();
        let n_phones = self.slots.len();
        let mut stats = StepStats::default();

        self.mask.clear();
        for slot in &self.slots {
            if slot.score.iter().any(|&s| s > WORST_SCORE) {
                for &sen in mdef.sseq_senones(slot.sseq) {
                    self.mask.set(sen);
                }
            }
        }
        let senscr = scorer.score_frame(frame, Some(&self.mask))?.to_vec();

        let entered = std::mem::replace(&mut self.pending_entered, vec![false; n_phones]);
        let mut rec = FrameRec {
            choice: vec![[0; MAX_EMIT_STATES]; n_phones],
            out_choice: vec![0; n_phones],
            entered,
            score: vec![[WORST_SCORE; MAX_EMIT_STATES]; n_phones],
            out_score: vec![WORST_SCORE; n_phones],
        };

        for (p, slot) in self.slots.iter_mut().enumerate() {
            if slot.score.iter().all(|&s| s <= WORST_SCORE) {
                continue;
            }
            stats.hmm_evals += 1;
            let tmat = mdef.tmat(slot.tmat);
            let senones = mdef.sseq_senones(slot.sseq);
            let old = slot.score;
            for s in 0..n {
                let mut best = WORST_SCORE;
                let mut who = 0u8;
                for q in 0..=s {
                    let tp = tmat[(q, s)];
                    if tp <= WORST_SCORE || old[q] <= WORST_SCORE {
                        continue;
                    }
                    let cand = old[q] + tp;
                    if cand > best {
                        best = cand;
                        who = q as u8;
                    }
                }
                if best > WORST_SCORE {
                    best = best
                        .saturating_add(senscr[senones[s] as usize])
                        .max(WORST_SCORE);
                }
                slot.score[s] = best;
                rec.choice[p][s] = who;
            }
            let mut out = WORST_SCORE;
            let mut who = 0u8;
            for q in 0..n {
                let tp = tmat[(q, n)];
                if tp <= WORST_SCORE || slot.score[q] <= WORST_SCORE {
                    continue;
                }
                let cand = slot.score[q] + tp;
                if cand > out {
                    out = cand;
                    who = q as u8;
                }
            }
            rec.out_choice[p] = who;
            rec.out_score[p] = out;
            rec.score[p] = slot.score;
        }

        // Phone-to-phone transition for the next frame.
        for p in 0..n_phones - 1 {
            let out = rec.out_score[p];
            if out > WORST_SCORE && out > self.slots[p + 1].score[0] {
                self.slots[p + 1].score[0] = out;
                self.pending_entered[p + 1] = true;
            }
        }

        self.records.push(rec);
        self.frame += 1;
        Ok(stats)
    }

    fn finish(&mut self, _scorer: &mut AcousticScorer) -> Result<()> {
        let result = self.backtrace();
        self.done = result.is_ok();
        debug!(ok = self.done, "alignment finished");
        result
    }

    fn hypothesis(&mut self) -> Option<Hypothesis> {
        if !self.done {
            return None;
        }
        let dict = &self.alignment.dict;
        let text = self
            .alignment
            .words
            .iter()
            .map(|w| dict.text(dict.base_wid(w.wid)))
            .collect::<Vec<_>>()
            .join(" ");
        Some(Hypothesis {
            text,
            score: self.alignment.total_score.unwrap_or(WORST_SCORE),
        })
    }

    fn segments(&mut self) -> Vec<Segment> {
        if !self.done {
            return Vec::new();
        }
        let dict = &self.alignment.dict;
        self.alignment
            .words
            .iter()
            .map(|w| Segment {
                word: dict.text(w.wid).to_string(),
                wid: w.wid,
                sf: w.start,
                ef: w.start + w.duration - 1,
                ascr: w.score,
                lscr: 0,
                post: None,
            })
            .collect()
    }

    fn lattice(&mut self) -> Option<Arc<Lattice>> {
        None
    }

    fn alignment(&self) -> Option<&Alignment> {
        self.done.then_some(&self.alignment)
    }
}
