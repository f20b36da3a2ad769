//! Best-first n-best path enumeration over a finished lattice.
//!
//! Partial paths grow backwards from the end node; the priority is the exact
//! score of the suffix plus the best forward-Viterbi score from the start to
//! the suffix's first node, precomputed once per lattice. Paths therefore
//! pop in (approximately, the re-applied LM permitting) non-increasing order
//! of complete-path score. The iterator is one-shot: it consumes its queue.
use crate::dict::{Dictionary, WordId};
use crate::lattice::{LatNodeId, Lattice};
use crate::lm::{trigram_score, LanguageModel, NO_LM_WORD};
use crate::logmath::{Score, WORST_SCORE};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct NbestHyp {
    /// Every traversed word, fillers included, start sentinel excluded.
    pub wids: Vec<WordId>,
    /// Hypothesis string: real words only.
    pub text: String,
    pub score: Score,
}

struct PathStep {
    node: LatNodeId,
    parent: Option<usize>,
    /// Exact score of the suffix from `node` to the lattice end.
    g: Score,
}

struct QueueEntry {
    f: Score,
    step: usize,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.f.cmp(&other.f)
    }
}

pub struct NBest {
    lattice: Arc<Lattice>,
    lm: Arc<dyn LanguageModel>,
    dict: Arc<Dictionary>,
    /// Best start-to-node score over lattice link scores; the A* heuristic.
    best_from_start: Vec<Score>,
    steps: Vec<PathStep>,
    queue: BinaryHeap<QueueEntry>,
    /// `(node, first two words)` contexts already expanded.
    expanded: HashSet<(LatNodeId, WordId, WordId)>,
    emitted: HashSet<Vec<WordId>>,
    min_ef_range: usize,
}

impl NBest {
    pub fn new(
        lattice: Arc<Lattice>,
        lm: Arc<dyn LanguageModel>,
        min_ef_range: usize,
    ) -> Self {
        let dict = lattice.dict().clone();
        let best_from_start = forward_viterbi(&lattice);
        let mut nbest = Self {
            lattice: lattice.clone(),
            lm,
            dict,
            best_from_start,
            steps: Vec::new(),
            queue: BinaryHeap::new(),
            expanded: HashSet::new(),
            emitted: HashSet::new(),
            min_ef_range,
        };
        nbest.steps.push(PathStep {
            node: lattice.end(),
            parent: None,
            g: 0,
        });
        let f = nbest.best_from_start[lattice.end() as usize];
        nbest.queue.push(QueueEntry { f, step: 0 });
        nbest
    }

    fn first_words(&self, step: &PathStep) -> (WordId, WordId) {
        let w0 = self.lattice.node(step.node).wid;
        let w1 = match step.parent {
            Some(p) => self.lattice.node(self.steps[p].node).wid,
            None => WordId::MAX,
        };
        (w0, w1)
    }

    fn emit(&mut self, step: usize) -> Option<NbestHyp> {
        let score = self.steps[step].g;
        let mut wids = Vec::new();
        let mut cur = Some(step);
        while let Some(i) = cur {
            wids.push(self.lattice.node(self.steps[i].node).wid);
            cur = self.steps[i].parent;
        }
        // The walk starts at the start sentinel.
        wids.remove(0);
        if !self.emitted.insert(wids.clone()) {
            return None;
        }
        let text = wids
            .iter()
            .filter(|&&w| !self.dict.is_filler(w))
            .map(|&w| self.dict.text(self.dict.base_wid(w)))
            .collect::<Vec<_>>()
            .join(" ");
        Some(NbestHyp { wids, text, score })
    }
}

impl Iterator for NBest {
    type Item = NbestHyp;

    fn next(&mut self) -> Option<NbestHyp> {
        while let Some(QueueEntry { step, .. }) = self.queue.pop() {
            let node = self.steps[step].node;
            if node == self.lattice.start() {
                if let Some(hyp) = self.emit(step) {
                    return Some(hyp);
                }
                continue;
            }
            let (w0, w1) = self.first_words(&self.steps[step]);
            if !self.expanded.insert((node, w0, w1)) {
                continue;
            }
            let in_links: Vec<_> = self.lattice.node(node).in_links.clone();
            let g = self.steps[step].g;
            let w0_lm = self
                .lm
                .word_id(self.dict.text(self.dict.base_wid(w0)))
                .unwrap_or(NO_LM_WORD);
            for (_, link) in self.lattice.live_links(&in_links) {
                let from = link.from;
                let from_node = self.lattice.node(from);
                if from != self.lattice.start()
                    && from_node.n_ef < self.min_ef_range
                {
                    continue;
                }
                // LM score of the suffix's first word under its newly known
                // predecessor; filler transitions already carry their
                // penalty in the link score.
                let lm_score = if self.dict.is_filler(w0) {
                    0
                } else {
                    let h = if from == self.lattice.start() {
                        self.lm.start_id()
                    } else {
                        self.lm
                            .word_id(self.dict.text(self.dict.base_wid(from_node.wid)))
                            .unwrap_or(NO_LM_WORD)
                    };
                    trigram_score(&*self.lm, w0_lm, h, NO_LM_WORD)
                };
                let g2 = g + link.ascr + lm_score
                    + if self.dict.is_filler(w0) { link.lscr } else { 0 };
                if g2 <= WORST_SCORE {
                    continue;
                }
                let idx = self.steps.len();
                self.steps.push(PathStep {
                    node: from,
                    parent: Some(step),
                    g: g2,
                });
                self.queue.push(QueueEntry {
                    f: g2 + self.best_from_start[from as usize],
                    step: idx,
                });
            }
        }
        None
    }
}

/// Best path score from the lattice start to each node over the lattice's
/// recorded link scores.
fn forward_viterbi(lattice: &Lattice) -> Vec<Score> {
    let n = lattice.n_nodes();
    let mut order: Vec<LatNodeId> = (0..n as LatNodeId).collect();
    order.sort_by_key(|&id| (lattice.node(id).sf, id));
    let mut best = vec![WORST_SCORE; n];
    best[lattice.start() as usize] = 0;
    for &u in &order {
        if best[u as usize] <= WORST_SCORE {
            continue;
        }
        let node = lattice.node(u);
        for (_, link) in lattice.live_links(&node.out_links) {
            let cand = best[u as usize] + link.ascr + link.lscr;
            let v = link.to as usize;
            if cand > best[v] {
                best[v] = cand;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::tests::toy_mdef;
    use crate::dict::Dictionary;
    use crate::dict2pid::PhoneIdMap;
    use crate::hmm::HistId;
    use crate::lm::{FillerPenalties, TableLmBuilder};
    use crate::logmath::LogMath;
    use crate::vithist::{LmContext, ViterbiHistory};
    use std::io;

    /// Lattice with two alternatives for the first word and a shared second
    /// word: <s> -> {HI | BAY} -> FIVE -> </s>, HI the better path.
    fn braided() -> (Arc<Lattice>, Arc<crate::lm::TableLm>, Arc<Dictionary>) {
        let lmath = LogMath::new(1.0001).unwrap();
        let mdef = toy_mdef();
        let main = io::Cursor::new("HI B AH\nBAY B AY\nFIVE F AY V\n");
        let dict = Arc::new(
            Dictionary::from_readers(mdef.clone(), main, None::<io::Empty>).unwrap(),
        );
        let d2p = PhoneIdMap::build(mdef, &dict);
        let mut b = TableLmBuilder::new(lmath.clone(), 1.0, 1.0);
        b.unigram("HI", 0.4, 1.0)
            .unigram("BAY", 0.4, 1.0)
            .unigram("FIVE", 0.2, 1.0);
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

        let hi = dict.word_id("HI").unwrap();
        let bay = dict.word_id("BAY").unwrap();
        let five = dict.word_id("FIVE").unwrap();
        let mut vh = ViterbiHistory::new(-1_000_000);
        vh.utt_begin(dict.start_wid(), lm.start_id());
        vh.rescore(&ctx, hi, 0, -100, 0, 0);
        vh.rescore(&ctx, bay, 0, -900, 0, 0);
        vh.frame_windup(0);
        let r = vh.frame_range(0);
        let preds: Vec<HistId> = r.map(|i| i as HistId).collect();
        for &p in &preds {
            vh.rescore(&ctx, five, 1, vh.entry(p).score - 100, p, 0);
        }
        vh.frame_windup(1);
        let exit = vh.final_result(&ctx).unwrap();
        let lat = Arc::new(Lattice::build(dict.clone(), lmath, &vh, exit));
        (lat, lm, dict)
    }

    #[test]
    fn paths_come_out_best_first_without_duplicates() {
        let (lat, lm, _dict) = braided();
        let nbest = NBest::new(lat, lm, 0);
        let hyps: Vec<NbestHyp> = nbest.collect();
        assert_eq!(hyps.len(), 2);
        assert_eq!(hyps[0].text, "HI FIVE");
        assert_eq!(hyps[1].text, "BAY FIVE");
        assert!(hyps[0].score >= hyps[1].score);
        // No duplicate word sequences.
        let mut seen = HashSet::new();
        assert!(hyps.iter().all(|h| seen.insert(h.wids.clone())));
    }

    #[test]
    fn min_ef_range_filters_thin_nodes() {
        let (lat, lm, _dict) = braided();
        // Every node has a single end frame, so a threshold of 2 leaves no
        // intermediate node usable.
        let mut nbest = NBest::new(lat, lm, 2);
        assert!(nbest.next().is_none());
    }
}
