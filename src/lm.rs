//! The language model boundary.
//!
//! The decoder treats the LM as a black box behind [`LanguageModel`]:
//! word-id mapping plus `score(word | history)` returning a log-domain score
//! and the n-gram order that actually matched. File formats and smoothing
//! live outside the crate; [`TableLm`] is an in-memory Katz-backoff
//! implementation good for tests, grammars of a few thousand words, and as a
//! reference for what the trait expects.
//!
//! Filler words never reach the LM. They pay a fixed penalty instead and are
//! transparent to the history, which [`FillerPenalties`] precomputes per
//! dictionary word.
use crate::dict::{Dictionary, WordId};
use crate::logmath::{LogMath, Score, WORST_SCORE};
use std::collections::HashMap;
use std::sync::Arc;

pub type LmWordId = u32;
pub const NO_LM_WORD: LmWordId = u32::MAX;

pub trait LanguageModel: Send + Sync {
    fn n_words(&self) -> usize;
    fn word_id(&self, text: &str) -> Option<LmWordId>;
    fn word_text(&self, id: LmWordId) -> Option<&str>;
    fn start_id(&self) -> LmWordId;
    fn finish_id(&self) -> LmWordId;
    /// Id scored for out-of-vocabulary words, if the model has one.
    fn unknown_id(&self) -> Option<LmWordId>;
    /// Score of `w` after `history`, most recent history word first. Entries
    /// equal to `NO_LM_WORD` truncate the usable history. Returns the score
    /// and the order of the n-gram that matched (1 = unigram).
    fn score(&self, w: LmWordId, history: &[LmWordId]) -> (Score, u32);
}

/// Trigram score helper with the sentinel handling the searches want.
pub fn trigram_score(
    lm: &dyn LanguageModel,
    w: LmWordId,
    h0: LmWordId,
    h1: LmWordId,
) -> Score {
    let history = [h0, h1];
    let len = if h0 == NO_LM_WORD {
        0
    } else if h1 == NO_LM_WORD {
        1
    } else {
        2
    };
    lm.score(w, &history[..len]).0
}

/// In-memory backoff n-gram model up to trigrams. Probabilities are supplied
/// linear; the language weight and word insertion penalty are folded in at
/// build time, matching what file-backed models do at load.
pub struct TableLm {
    words: Vec<String>,
    index: HashMap<String, LmWordId>,
    unigram: Vec<Score>,
    unigram_bo: Vec<Score>,
    bigram: HashMap<(LmWordId, LmWordId), Score>,
    bigram_bo: HashMap<(LmWordId, LmWordId), Score>,
    trigram: HashMap<(LmWordId, LmWordId, LmWordId), Score>,
    start: LmWordId,
    finish: LmWordId,
    unknown: Option<LmWordId>,
}

pub struct TableLmBuilder {
    logmath: Arc<LogMath>,
    lw: f64,
    wip: Score,
    lm: TableLm,
}

impl TableLmBuilder {
    pub fn new(logmath: Arc<LogMath>, language_weight: f64, word_insertion_penalty: f64) -> Self {
        let wip = logmath.log(word_insertion_penalty);
        Self {
            logmath,
            lw: language_weight,
            wip,
            lm: TableLm {
                words: Vec::new(),
                index: HashMap::new(),
                unigram: Vec::new(),
                unigram_bo: Vec::new(),
                bigram: HashMap::new(),
                bigram_bo: HashMap::new(),
                trigram: HashMap::new(),
                start: NO_LM_WORD,
                finish: NO_LM_WORD,
                unknown: None,
            },
        }
    }

    fn weighted(&self, p: f64) -> Score {
        let raw = self.logmath.log(p);
        if raw <= WORST_SCORE {
            WORST_SCORE
        } else {
            ((raw as f64) * self.lw) as Score
        }
    }

    fn intern(&mut self, w: &str) -> LmWordId {
        if let Some(&id) = self.lm.index.get(w) {
            return id;
        }
        let id = self.lm.words.len() as LmWordId;
        self.lm.words.push(w.to_string());
        self.lm.index.insert(w.to_string(), id);
        self.lm.unigram.push(WORST_SCORE);
        self.lm.unigram_bo.push(0);
        id
    }

    pub fn unigram(&mut self, w: &str, p: f64, backoff: f64) -> &mut Self {
        let id = self.intern(w);
        self.lm.unigram[id as usize] = self.weighted(p) + self.wip;
        self.lm.unigram_bo[id as usize] = self.weighted(backoff);
        self
    }

    pub fn bigram(&mut self, h: &str, w: &str, p: f64, backoff: f64) -> &mut Self {
        let h = self.intern(h);
        let w = self.intern(w);
        self.lm.bigram.insert((h, w), self.weighted(p) + self.wip);
        self.lm.bigram_bo.insert((h, w), self.weighted(backoff));
        self
    }

    pub fn trigram(&mut self, h1: &str, h0: &str, w: &str, p: f64) -> &mut Self {
        let h1 = self.intern(h1);
        let h0 = self.intern(h0);
        let w = self.intern(w);
        self.lm.trigram.insert((h1, h0, w), self.weighted(p) + self.wip);
        self
    }

    pub fn build(mut self) -> Arc<TableLm> {
        self.lm.start = self.intern("<s>");
        self.lm.finish = self.intern("</s>");
        self.lm.unknown = self.lm.index.get("<unk>").copied();
        // A start symbol nobody scored still needs to be usable history.
        if self.lm.unigram[self.lm.start as usize] <= WORST_SCORE {
            self.lm.unigram[self.lm.start as usize] = self.wip;
        }
        Arc::new(self.lm)
    }
}

impl TableLm {
    fn unigram_score(&self, w: LmWordId) -> Score {
        let s = self.unigram[w as usize];
        if s <= WORST_SCORE {
            match self.unknown {
                Some(unk) => self.unigram[unk as usize],
                None => WORST_SCORE / 2,
            }
        } else {
            s
        }
    }
}

impl LanguageModel for TableLm {
    fn n_words(&self) -> usize {
        self.words.len()
    }

    fn word_id(&self, text: &str) -> Option<LmWordId> {
        self.index.get(text).copied()
    }

    fn word_text(&self, id: LmWordId) -> Option<&str> {
        self.words.get(id as usize).map(|s| s.as_str())
    }

    fn start_id(&self) -> LmWordId {
        self.start
    }

    fn finish_id(&self) -> LmWordId {
        self.finish
    }

    fn unknown_id(&self) -> Option<LmWordId> {
        self.unknown
    }

    fn score(&self, w: LmWordId, history: &[LmWordId]) -> (Score, u32) {
        if w as usize >= self.words.len() {
            return (WORST_SCORE / 2, 0);
        }
        let h0 = history.first().copied().filter(|&h| h != NO_LM_WORD);
        let h1 = history.get(1).copied().filter(|&h| h != NO_LM_WORD);

        if let (Some(h0), Some(h1)) = (h0, h1) {
            if let Some(&s) = self.trigram.get(&(h1, h0, w)) {
                return (s, 3);
            }
            let bo = self.bigram_bo.get(&(h1, h0)).copied().unwrap_or(0);
            if let Some(&s) = self.bigram.get(&(h0, w)) {
                return (bo + s, 2);
            }
            let bo = bo + self.unigram_bo[h0 as usize];
            return (bo + self.unigram_score(w), 1);
        }
        if let Some(h0) = h0 {
            if let Some(&s) = self.bigram.get(&(h0, w)) {
                return (s, 2);
            }
            return (self.unigram_bo[h0 as usize] + self.unigram_score(w), 1);
        }
        (self.unigram_score(w), 1)
    }
}

/// Per-word filler transition penalties, applied where the LM score would go
/// for words the LM does not know about by design.
#[derive(Debug)]
pub struct FillerPenalties {
    pen: Vec<Score>,
}

impl FillerPenalties {
    pub fn new(
        logmath: &LogMath,
        dict: &Dictionary,
        silence_prob: f64,
        filler_prob: f64,
        language_weight: f64,
    ) -> Self {
        let weighted = |p: f64| -> Score {
            let raw = logmath.log(p);
            if raw <= WORST_SCORE {
                WORST_SCORE
            } else {
                ((raw as f64) * language_weight) as Score
            }
        };
        let sil = weighted(silence_prob);
        let fill = weighted(filler_prob);
        let pen = (0..dict.len() as WordId)
            .map(|w| {
                if w == dict.silence_wid() {
                    sil
                } else if dict.is_filler(w) {
                    fill
                } else {
                    0
                }
            })
            .collect();
        Self { pen }
    }

    pub fn penalty(&self, wid: WordId) -> Score {
        self.pen[wid as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lm() -> Arc<TableLm> {
        let lmath = LogMath::new(1.0001).unwrap();
        let mut b = TableLmBuilder::new(lmath, 1.0, 1.0);
        b.unigram("<s>", 0.2, 0.5)
            .unigram("</s>", 0.2, 1.0)
            .unigram("hello", 0.3, 0.5)
            .unigram("world", 0.3, 0.5)
            .bigram("<s>", "hello", 0.8, 0.9)
            .bigram("hello", "world", 0.7, 1.0)
            .trigram("<s>", "hello", "world", 0.9);
        b.build()
    }

    #[test]
    fn backoff_ladder() {
        let lm = lm();
        let hello = lm.word_id("hello").unwrap();
        let world = lm.word_id("world").unwrap();
        let start = lm.start_id();

        // Exact trigram.
        let (s3, o3) = lm.score(world, &[hello, start]);
        assert_eq!(o3, 3);
        // Bigram when the trigram is absent.
        let (s2, o2) = lm.score(world, &[hello, world]);
        assert_eq!(o2, 2);
        // Unigram fallback picks up the backoff weights.
        let (_, o1) = lm.score(hello, &[world, world]);
        assert_eq!(o1, 1);
        assert!(s3 > s2);
    }

    #[test]
    fn history_sentinels_truncate() {
        let lm = lm();
        let hello = lm.word_id("hello").unwrap();
        let (s_none, o) = lm.score(hello, &[NO_LM_WORD, NO_LM_WORD]);
        assert_eq!(o, 1);
        let (s_uni, _) = lm.score(hello, &[]);
        assert_eq!(s_none, s_uni);
        let via_helper = trigram_score(&*lm, hello, NO_LM_WORD, NO_LM_WORD);
        assert_eq!(via_helper, s_uni);
    }

    #[test]
    fn language_weight_scales_scores() {
        let lmath = LogMath::new(1.0001).unwrap();
        let mut a = TableLmBuilder::new(lmath.clone(), 1.0, 1.0);
        a.unigram("x", 0.5, 1.0);
        let a = a.build();
        let mut b = TableLmBuilder::new(lmath, 2.0, 1.0);
        b.unigram("x", 0.5, 1.0);
        let b = b.build();
        let xa = a.word_id("x").unwrap();
        let xb = b.word_id("x").unwrap();
        assert_eq!(b.score(xb, &[]).0, 2 * a.score(xa, &[]).0);
    }
}
