//! Shared-prefix lexical tree.
//!
//! Words with a common initial phone sequence share tree nodes (and their
//! HMMs) until they diverge, which is where most of the first pass's speed
//! comes from. The root level is replicated per incoming left context so the
//! first phone of every word carries the right cross-word triphone. Leaves
//! are per word and initially "unexpanded": their final phone depends on the
//! *next* word, so on first entry they fan out into one child per distinct
//! right-context senone sequence from the phone identity map, and that
//! expansion is torn back down at utterance end.
//!
//! Each node carries a language-model look-ahead score: the best unigram
//! probability of any word reachable through it, used to tighten the beam
//! inside the tree. Nodes live in an arena and refer to each other by index;
//! the lazily added cross-word nodes sit at the arena tail so resetting the
//! tree is a truncation.
use crate::dict::{Dictionary, WordId, NO_WORD};
use crate::dict2pid::PhoneIdMap;
use crate::hmm::{Frame, Hmm, HmmContext};
use crate::logmath::{Score, WORST_SCORE};
use crate::mdef::{CiPhoneId, ModelDef, NO_SSEQ};
use crate::senone::SenoneMask;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info};

pub type NodeId = u32;
pub const NO_NODE: NodeId = u32::MAX;

/// Compressed right-context slot of an expanded cross-word node.
pub const NO_RC: u16 = u16::MAX;

#[derive(Debug, Clone)]
pub struct LexNode {
    pub hmm: Hmm,
    pub children: Vec<NodeId>,
    /// Dictionary word if this is a leaf, `NO_WORD` for shared internals.
    pub wid: WordId,
    /// LM look-ahead: best probability of any word below this node.
    pub prob: Score,
    pub ci: CiPhoneId,
    /// `NO_RC` for internal nodes and unexpanded leaves.
    pub rc: u16,
}

impl LexNode {
    fn new(wid: WordId, prob: Score, ci: CiPhoneId, sseq: u32, tmat: u32, rc: u16) -> Self {
        Self {
            hmm: Hmm::new(sseq, tmat),
            children: Vec::new(),
            wid,
            prob,
            ci,
            rc,
        }
    }

    /// Leaf that has not fanned out into right-context variants yet.
    fn is_unexpanded_leaf(&self) -> bool {
        self.wid != NO_WORD && self.rc == NO_RC
    }
}

#[derive(Debug, Clone)]
pub struct LexTree {
    mdef: Arc<ModelDef>,
    dict: Arc<Dictionary>,
    d2p: Arc<PhoneIdMap>,
    nodes: Vec<LexNode>,
    /// Arena size at construction; everything past this is lazy cross-word
    /// expansion.
    n_base_nodes: usize,
    /// Root subsets per left-context CI phone; empty for the filler tree,
    /// which keeps a single root set.
    lcroot: Vec<Vec<NodeId>>,
    roots: Vec<NodeId>,
    active: Vec<NodeId>,
    next_active: Vec<NodeId>,
    filler: bool,
}

impl LexTree {
    /// Build the n-gram tree over `words`, each with its look-ahead score.
    pub fn new_ngram(
        dict: Arc<Dictionary>,
        d2p: Arc<PhoneIdMap>,
        words: &[(WordId, Score)],
    ) -> Self {
        let mdef = dict.mdef().clone();
        let n_ci = mdef.n_ciphone();
        let mut tree = Self {
            mdef: mdef.clone(),
            dict: dict.clone(),
            d2p: d2p.clone(),
            nodes: Vec::new(),
            n_base_nodes: 0,
            lcroot: vec![Vec::new(); n_ci],
            roots: Vec::new(),
            active: Vec::new(),
            next_active: Vec::new(),
            filler: false,
        };

        // Multi-phone roots shared by senone sequence; (root, lc) pairs
        // already linked into a left-context subset.
        let mut root_by_sseq: HashMap<u32, NodeId> = HashMap::new();
        let mut entered: HashSet<(NodeId, CiPhoneId)> = HashSet::new();

        for &(wid, prob) in words {
            let pron = dict.pronunciation(wid).to_vec();
            if pron.len() == 1 {
                let ci = pron[0];
                // One unexpanded leaf per left context; the fan-out differs
                // per context so these are not shared.
                for lc in 0..n_ci as CiPhoneId {
                    let id = tree.alloc(LexNode::new(
                        wid,
                        prob,
                        ci,
                        NO_SSEQ,
                        mdef.ci_tmat(ci),
                        NO_RC,
                    ));
                    tree.lcroot[lc as usize].push(id);
                    tree.roots.push(id);
                }
                continue;
            }

            // Roots for each left context, deduplicated by senone sequence.
            let ci = pron[0];
            let second = pron[1];
            let mut parents: Vec<NodeId> = Vec::new();
            for lc in 0..n_ci as CiPhoneId {
                let sseq = d2p.ldiph(ci, second, lc);
                let id = match root_by_sseq.get(&sseq) {
                    Some(&id) => {
                        let node = &mut tree.nodes[id as usize];
                        if node.prob < prob {
                            node.prob = prob;
                        }
                        id
                    }
                    None => {
                        let id = tree.alloc(LexNode::new(
                            NO_WORD,
                            prob,
                            ci,
                            sseq,
                            mdef.ci_tmat(ci),
                            NO_RC,
                        ));
                        root_by_sseq.insert(sseq, id);
                        tree.roots.push(id);
                        id
                    }
                };
                if entered.insert((id, lc)) {
                    tree.lcroot[lc as usize].push(id);
                }
                if !parents.contains(&id) {
                    parents.push(id);
                }
            }

            // Internal phones share nodes below their parents.
            for p in 1..pron.len() - 1 {
                let sseq = d2p.internal_sseq(wid, p);
                let ci = pron[p];
                let mut found = None;
                'search: for &parent in &parents {
                    for &cid in &tree.nodes[parent as usize].children {
                        let c = &tree.nodes[cid as usize];
                        if c.wid == NO_WORD && c.hmm.sseq == sseq {
                            found = Some(cid);
                            break 'search;
                        }
                    }
                }
                let id = match found {
                    Some(id) => {
                        let node = &mut tree.nodes[id as usize];
                        if node.prob < prob {
                            node.prob = prob;
                        }
                        id
                    }
                    None => tree.alloc(LexNode::new(
                        NO_WORD,
                        prob,
                        ci,
                        sseq,
                        mdef.ci_tmat(ci),
                        NO_RC,
                    )),
                };
                for &parent in &parents {
                    if !tree.nodes[parent as usize].children.contains(&id) {
                        tree.nodes[parent as usize].children.push(id);
                    }
                }
                parents = vec![id];
            }

            // Final phone: an unexpanded leaf, never shared.
            let last = *pron.last().unwrap();
            let id = tree.alloc(LexNode::new(
                wid,
                prob,
                last,
                NO_SSEQ,
                mdef.ci_tmat(last),
                NO_RC,
            ));
            for &parent in &parents {
                tree.nodes[parent as usize].children.push(id);
            }
        }

        tree.n_base_nodes = tree.nodes.len();
        info!(
            words = words.len(),
            nodes = tree.n_base_nodes,
            "lexical tree built"
        );
        tree
    }

    /// Filler tree: context-free models for the filler words, one shared
    /// root set entered regardless of left context.
    pub fn new_filler(dict: Arc<Dictionary>, d2p: Arc<PhoneIdMap>) -> Self {
        let mdef = dict.mdef().clone();
        let mut tree = Self {
            mdef: mdef.clone(),
            dict: dict.clone(),
            d2p,
            nodes: Vec::new(),
            n_base_nodes: 0,
            lcroot: Vec::new(),
            roots: Vec::new(),
            active: Vec::new(),
            next_active: Vec::new(),
            filler: true,
        };
        for wid in dict.search_fillers().collect::<Vec<_>>() {
            let pron = dict.pronunciation(wid).to_vec();
            let mut parent: Option<NodeId> = None;
            for &ci in pron.iter().take(pron.len() - 1) {
                let id = tree.alloc(LexNode::new(
                    NO_WORD,
                    0,
                    ci,
                    mdef.ci_sseq(ci),
                    mdef.ci_tmat(ci),
                    NO_RC,
                ));
                match parent {
                    Some(par) => tree.nodes[par as usize].children.push(id),
                    None => tree.roots.push(id),
                }
                parent = Some(id);
            }
            let last = *pron.last().unwrap();
            let leaf = tree.alloc(LexNode::new(
                wid,
                0,
                last,
                NO_SSEQ,
                mdef.ci_tmat(last),
                NO_RC,
            ));
            match parent {
                Some(par) => tree.nodes[par as usize].children.push(leaf),
                None => tree.roots.push(leaf),
            }
        }
        tree.n_base_nodes = tree.nodes.len();
        tree
    }

    fn alloc(&mut self, node: LexNode) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &LexNode {
        &self.nodes[id as usize]
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_active(&self) -> usize {
        self.active.len()
    }

    /// Fan a leaf out into its right-context variants. `lc` is the phone
    /// preceding the leaf: the previous phone of the word, or the incoming
    /// cross-word context for single-phone words.
    fn expand_leaf(&mut self, leaf: NodeId, lc: CiPhoneId) {
        let (wid, prob, ci) = {
            let n = &self.nodes[leaf as usize];
            (n.wid, n.prob, n.ci)
        };
        let tmat = self.mdef.ci_tmat(ci);
        if self.filler {
            // Fillers are context free; a single variant keeps the shape
            // uniform.
            let sseq = self.mdef.ci_sseq(ci);
            let id = self.alloc(LexNode::new(wid, prob, ci, sseq, tmat, 0));
            self.nodes[leaf as usize].children.push(id);
            return;
        }
        let sseqs = if self.dict.pron_len(wid) == 1 {
            self.d2p.lrssid(ci, lc).sseq.clone()
        } else {
            self.d2p.rssid(ci, lc).sseq.clone()
        };
        debug_assert!(!sseqs.is_empty());
        for (rc, &sseq) in sseqs.iter().enumerate() {
            let id = self.alloc(LexNode::new(wid, prob, ci, sseq, tmat, rc as u16));
            self.nodes[leaf as usize].children.push(id);
        }
    }

    fn seed(&mut self, id: NodeId, score: Score, hist: i32, nf: Frame, thresh: Score) {
        let node = &mut self.nodes[id as usize];
        let scr = score + node.prob;
        if scr >= thresh && scr > node.hmm.in_score() && node.hmm.enter(scr, hist, nf) {
            self.next_active.push(id);
        }
    }

    /// Seed the roots reachable under left context `lc` for evaluation at
    /// `cf + 1`. Single-phone leaves expand and seed their right-context
    /// variants instead of themselves.
    pub fn enter(
        &mut self,
        lc: CiPhoneId,
        cf: Frame,
        inscore: Score,
        inhist: i32,
        thresh: Score,
    ) {
        let nf = cf + 1;
        let roots: Vec<NodeId> = if self.filler {
            self.roots.clone()
        } else {
            self.lcroot[lc as usize].clone()
        };
        for id in roots {
            if self.nodes[id as usize].wid == NO_WORD {
                self.seed(id, inscore, inhist, nf, thresh);
            } else {
                if self.nodes[id as usize].children.is_empty() {
                    self.expand_leaf(id, lc);
                }
                let children = self.nodes[id as usize].children.clone();
                for cid in children {
                    self.seed(cid, inscore, inhist, nf, thresh);
                }
            }
        }
    }

    /// Union the senones of every active node into `mask`.
    pub fn active_senones(&self, mask: &mut SenoneMask) {
        for &id in &self.active {
            let sseq = self.nodes[id as usize].hmm.sseq;
            debug_assert_ne!(sseq, NO_SSEQ);
            for &sen in self.mdef.sseq_senones(sseq) {
                mask.set(sen);
            }
        }
    }

    /// Viterbi-update every active HMM. Returns the best state score and the
    /// best expanded-leaf (word exit candidate) score.
    pub fn hmm_eval(&mut self, ctx: &HmmContext, senscr: &[Score], frame: Frame) -> (Score, Score) {
        let mut best = WORST_SCORE;
        let mut wbest = WORST_SCORE;
        for i in 0..self.active.len() {
            let id = self.active[i] as usize;
            debug_assert_eq!(self.nodes[id].hmm.frame, frame);
            let k = ctx.eval(&mut self.nodes[id].hmm, senscr);
            if k > best {
                best = k;
            }
            if self.nodes[id].wid != NO_WORD && k > wbest {
                wbest = k;
            }
        }
        (best, wbest)
    }

    /// Histogram of active best scores below `best`, bucketed by `bin_width`.
    pub fn histbin(&self, best: Score, bins: &mut [usize], bin_width: Score) {
        for &id in &self.active {
            let node = &self.nodes[id as usize];
            let k = ((best - node.hmm.best_score) / bin_width.max(1)) as usize;
            bins[k.min(bins.len() - 1)] += 1;
        }
    }

    /// Cross-HMM propagation for everything but word exits: keep or retire
    /// each active HMM for the next frame, and push exit scores into child
    /// HMMs, expanding leaves on first touch.
    pub fn propagate_non_leaves(&mut self, cf: Frame, th: Score, pth: Score) {
        let nf = cf + 1;
        for i in 0..self.active.len() {
            let id = self.active[i];
            {
                let node = &mut self.nodes[id as usize];
                if node.hmm.frame < nf {
                    if node.hmm.best_score >= th {
                        node.hmm.frame = nf;
                        self.next_active.push(id);
                    } else {
                        node.hmm.clear();
                    }
                }
            }
            let (wid, out_score, out_hist, prob, ci) = {
                let node = &self.nodes[id as usize];
                (
                    node.wid,
                    node.hmm.out_score,
                    node.hmm.out_history,
                    node.prob,
                    node.ci,
                )
            };
            if wid != NO_WORD {
                continue; // Leaves exit through propagate_leaves.
            }
            if out_score < pth {
                continue;
            }
            let children = self.nodes[id as usize].children.clone();
            for cid in children {
                // The seed adds the child's own look-ahead, so the carried
                // score is the exit minus the look-ahead already cashed in.
                if self.nodes[cid as usize].is_unexpanded_leaf() {
                    if self.nodes[cid as usize].children.is_empty() {
                        self.expand_leaf(cid, ci);
                    }
                    let grandchildren = self.nodes[cid as usize].children.clone();
                    for gid in grandchildren {
                        self.seed(gid, out_score - prob, out_hist, nf, th);
                    }
                } else {
                    self.seed(cid, out_score - prob, out_hist, nf, th);
                }
            }
        }
    }

    /// Word exits: every active expanded leaf good enough for the word beam
    /// reports into the history table via `report`, which receives
    /// `(wid, exit score, history, compressed rc)`.
    pub fn propagate_leaves<F>(&mut self, wth: Score, mut report: F)
    where
        F: FnMut(WordId, Score, i32, u16),
    {
        for &id in &self.active {
            let node = &self.nodes[id as usize];
            if node.wid == NO_WORD || node.rc == NO_RC {
                continue;
            }
            if node.hmm.out_score < wth {
                continue;
            }
            if node.hmm.out_history < 0 {
                debug_assert!(false, "word exit without history");
                error!(wid = node.wid, "word exit with no history, dropped");
                continue;
            }
            report(
                node.wid,
                node.hmm.out_score - node.prob,
                node.hmm.out_history,
                node.rc,
            );
        }
    }

    /// Promote the next-frame active set.
    pub fn swap_active(&mut self) {
        std::mem::swap(&mut self.active, &mut self.next_active);
        self.next_active.clear();
    }

    /// Return the tree to its construction-time shape: drop the lazily
    /// expanded cross-word nodes and quiesce every HMM.
    pub fn utt_end(&mut self) {
        let base = self.n_base_nodes;
        self.nodes.truncate(base);
        for node in &mut self.nodes {
            node.children.retain(|&c| (c as usize) < base);
            node.hmm.clear();
        }
        self.active.clear();
        self.next_active.clear();
    }
}
