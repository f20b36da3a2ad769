//! Word lattice.
//!
//! Built from the backpointer table once the utterance ends: one node per
//! distinct `(word, start frame)`, one link per recorded word transition,
//! carrying the acoustic and language scores of the target word instance.
//! Links always point forward in time, so sorting nodes by start frame is a
//! topological order and everything downstream (reachability, best path,
//! forward-backward) is a single sweep.
//!
//! Filler words can be bypassed so LM-level consumers see only real words;
//! the original links are kept, suppressed, and can be restored.
use crate::dict::{Dictionary, WordId};
use crate::error::{DecodeError, Result};
use crate::hmm::{Frame, HistId};
use crate::lm::{trigram_score, LanguageModel, LmWordId, NO_LM_WORD};
use crate::logmath::{LogMath, Score, WORST_SCORE};
use crate::vithist::ViterbiHistory;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

pub type LatNodeId = u32;
pub type LinkId = u32;
pub const NO_LATNODE: LatNodeId = u32::MAX;

#[derive(Debug, Clone)]
pub struct LatNode {
    pub wid: WordId,
    pub sf: Frame,
    /// Range and count of distinct end frames seen for this node.
    pub min_ef: Frame,
    pub max_ef: Frame,
    pub n_ef: usize,
    pub in_links: Vec<LinkId>,
    pub out_links: Vec<LinkId>,
}

#[derive(Debug, Clone)]
pub struct LatLink {
    pub from: LatNodeId,
    pub to: LatNodeId,
    /// Acoustic and LM score of the target word instance.
    pub ascr: Score,
    pub lscr: Score,
    /// End frame of the target word instance.
    pub ef: Frame,
    /// Forward log-probability of paths ending with this link.
    pub alpha: Score,
    /// Backward log-probability from the link's target to the end.
    pub beta: Score,
    pub best_prev: Option<LinkId>,
    /// Inserted by `bypass_fillers`.
    pub bypass: bool,
    /// Hidden while a bypass stands in for it.
    pub suppressed: bool,
}

/// One word of a best path through the lattice.
#[derive(Debug, Clone)]
pub struct LatSegment {
    pub wid: WordId,
    pub sf: Frame,
    pub ef: Frame,
    pub ascr: Score,
    pub lscr: Score,
}

#[derive(Debug)]
pub struct Lattice {
    dict: Arc<Dictionary>,
    logmath: Arc<LogMath>,
    nodes: Vec<LatNode>,
    links: Vec<LatLink>,
    start: LatNodeId,
    end: LatNodeId,
    n_frames: Frame,
    /// Total path probability, valid after `compute_posteriors`.
    norm: Option<Score>,
}

impl Lattice {
    /// Build from the finished history table and its exit entry, then prune
    /// whatever does not lie on a start-to-end path.
    pub fn build(
        dict: Arc<Dictionary>,
        logmath: Arc<LogMath>,
        vh: &ViterbiHistory,
        exit: HistId,
    ) -> Self {
        let mut nodes: Vec<LatNode> = Vec::new();
        let mut links: Vec<LatLink> = Vec::new();
        let mut node_index: HashMap<(WordId, Frame), LatNodeId> = HashMap::new();
        let mut link_index: HashMap<(LatNodeId, LatNodeId), LinkId> = HashMap::new();

        let mut intern = |nodes: &mut Vec<LatNode>, wid: WordId, sf: Frame| -> LatNodeId {
            let sf = sf.max(0);
            *node_index.entry((wid, sf)).or_insert_with(|| {
                nodes.push(LatNode {
                    wid,
                    sf,
                    min_ef: Frame::MAX,
                    max_ef: -1,
                    n_ef: 0,
                    in_links: Vec::new(),
                    out_links: Vec::new(),
                });
                nodes.len() as LatNodeId - 1
            })
        };

        for (id, e) in vh.entries().iter().enumerate() {
            if !e.valid || e.pred < 0 {
                continue;
            }
            if id as HistId > exit {
                break;
            }
            let p = vh.entry(e.pred);
            let from = intern(&mut nodes, p.wid, p.sf);
            let to = intern(&mut nodes, e.wid, e.sf);
            let node = &mut nodes[to as usize];
            // Entries arrive in frame order, so a new end frame shows up as
            // an increase of max_ef.
            if node.n_ef == 0 || e.ef > node.max_ef {
                node.n_ef += 1;
            }
            if node.min_ef > e.ef || node.n_ef == 1 {
                node.min_ef = e.ef;
            }
            if node.max_ef < e.ef {
                node.max_ef = e.ef;
            }
            match link_index.get(&(from, to)) {
                Some(&l) => {
                    // Parallel transitions collapse onto the best-scoring one.
                    let link = &mut links[l as usize];
                    if e.ascr + e.lscr > link.ascr + link.lscr {
                        link.ascr = e.ascr;
                        link.lscr = e.lscr;
                        link.ef = e.ef;
                    }
                }
                None => {
                    let l = links.len() as LinkId;
                    links.push(LatLink {
                        from,
                        to,
                        ascr: e.ascr,
                        lscr: e.lscr,
                        ef: e.ef,
                        alpha: WORST_SCORE,
                        beta: WORST_SCORE,
                        best_prev: None,
                        bypass: false,
                        suppressed: false,
                    });
                    link_index.insert((from, to), l);
                    nodes[from as usize].out_links.push(l);
                    nodes[to as usize].in_links.push(l);
                }
            }
        }

        let sentinel = vh.entry(0);
        let exit_e = vh.entry(exit);
        let start = intern(&mut nodes, sentinel.wid, 0);
        let end = intern(&mut nodes, exit_e.wid, exit_e.sf);
        let mut lattice = Self {
            dict,
            logmath,
            nodes,
            links,
            start,
            end,
            n_frames: vh.n_frames(),
            norm: None,
        };
        lattice.remove_unreachable();
        info!(
            nodes = lattice.nodes.len(),
            links = lattice.links.len(),
            "lattice built"
        );
        lattice
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_links(&self) -> usize {
        self.links.len()
    }

    pub fn n_frames(&self) -> Frame {
        self.n_frames
    }

    pub fn start(&self) -> LatNodeId {
        self.start
    }

    pub fn end(&self) -> LatNodeId {
        self.end
    }

    pub fn node(&self, id: LatNodeId) -> &LatNode {
        &self.nodes[id as usize]
    }

    pub fn link(&self, id: LinkId) -> &LatLink {
        &self.links[id as usize]
    }

    pub fn dict(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    /// Active links only: not suppressed by a filler bypass.
    pub fn live_links<'a>(&'a self, ids: &'a [LinkId]) -> impl Iterator<Item = (LinkId, &'a LatLink)> {
        ids.iter()
            .map(move |&l| (l, &self.links[l as usize]))
            .filter(|(_, l)| !l.suppressed)
    }

    /// Node ids sorted by start frame, which is a topological order.
    fn topo_order(&self) -> Vec<LatNodeId> {
        let mut order: Vec<LatNodeId> = (0..self.nodes.len() as LatNodeId).collect();
        order.sort_by_key(|&n| (self.nodes[n as usize].sf, n));
        order
    }

    /// Drop nodes and links not on any start-to-end path.
    pub fn remove_unreachable(&mut self) {
        let n = self.nodes.len();
        let mut fwd = vec![false; n];
        let mut bwd = vec![false; n];
        let mut stack = vec![self.start];
        fwd[self.start as usize] = true;
        while let Some(u) = stack.pop() {
            for &l in &self.nodes[u as usize].out_links {
                let v = self.links[l as usize].to;
                if !fwd[v as usize] {
                    fwd[v as usize] = true;
                    stack.push(v);
                }
            }
        }
        let mut stack = vec![self.end];
        bwd[self.end as usize] = true;
        while let Some(u) = stack.pop() {
            for &l in &self.nodes[u as usize].in_links {
                let v = self.links[l as usize].from;
                if !bwd[v as usize] {
                    bwd[v as usize] = true;
                    stack.push(v);
                }
            }
        }

        let keep: Vec<bool> = (0..n).map(|i| fwd[i] && bwd[i]).collect();
        let mut node_map = vec![NO_LATNODE; n];
        let mut new_nodes = Vec::new();
        for (i, node) in self.nodes.drain(..).enumerate() {
            if keep[i] {
                node_map[i] = new_nodes.len() as LatNodeId;
                new_nodes.push(node);
            }
        }
        let mut link_map = vec![u32::MAX; self.links.len()];
        let mut new_links = Vec::new();
        for (i, mut link) in self.links.drain(..).enumerate() {
            if node_map[link.from as usize] != NO_LATNODE && node_map[link.to as usize] != NO_LATNODE
            {
                link.from = node_map[link.from as usize];
                link.to = node_map[link.to as usize];
                link_map[i] = new_links.len() as LinkId;
                new_links.push(link);
            }
        }
        for node in &mut new_nodes {
            node.in_links = node
                .in_links
                .iter()
                .filter_map(|&l| (link_map[l as usize] != u32::MAX).then(|| link_map[l as usize]))
                .collect();
            node.out_links = node
                .out_links
                .iter()
                .filter_map(|&l| (link_map[l as usize] != u32::MAX).then(|| link_map[l as usize]))
                .collect();
        }
        self.nodes = new_nodes;
        self.links = new_links;
        self.start = node_map[self.start as usize];
        self.end = node_map[self.end as usize];
        assert!(self.start != NO_LATNODE && self.end != NO_LATNODE);
    }

    fn is_filler_node(&self, id: LatNodeId) -> bool {
        let node = &self.nodes[id as usize];
        self.dict.is_filler(node.wid) && id != self.start && id != self.end
    }

    /// Insert direct links around filler words so no live path traverses
    /// one. The filler portion of each bypassed path has its LM score scaled
    /// by `lw_factor`. Original filler links are suppressed, not removed;
    /// [`Lattice::remove_bypass`] restores them. Fails without side effects
    /// visible to traversal if the edge budget would be exceeded.
    pub fn bypass_fillers(&mut self, lw_factor: f64, max_edges: usize) -> Result<()> {
        // Non-filler targets reachable from each filler node through filler
        // chains, with the accumulated scores of the chain.
        fn reach(
            lat: &Lattice,
            f: LatNodeId,
            lw_factor: f64,
            memo: &mut HashMap<LatNodeId, Vec<(LatNodeId, Score, Score, Frame)>>,
        ) -> Vec<(LatNodeId, Score, Score, Frame)> {
            if let Some(hit) = memo.get(&f) {
                return hit.clone();
            }
            let mut out = Vec::new();
            for &l in &lat.nodes[f as usize].out_links {
                let link = &lat.links[l as usize];
                if lat.is_filler_node(link.to) {
                    // The chained link carries the next filler's penalty,
                    // which is what the factor rescales.
                    let pen = (link.lscr as f64 * lw_factor) as Score;
                    for (v, a, s, ef) in reach(lat, link.to, lw_factor, memo) {
                        out.push((v, link.ascr + a, pen + s, ef));
                    }
                } else {
                    out.push((link.to, link.ascr, link.lscr, link.ef));
                }
            }
            memo.insert(f, out.clone());
            out
        }

        let mut memo = HashMap::new();
        let mut new_links: Vec<LatLink> = Vec::new();
        for u in 0..self.nodes.len() as LatNodeId {
            if self.is_filler_node(u) {
                continue;
            }
            for &l in &self.nodes[u as usize].out_links {
                let link = &self.links[l as usize];
                if link.suppressed || !self.is_filler_node(link.to) {
                    continue;
                }
                let pen = (link.lscr as f64 * lw_factor) as Score;
                for (v, a, s, ef) in reach(self, link.to, lw_factor, &mut memo) {
                    new_links.push(LatLink {
                        from: u,
                        to: v,
                        ascr: link.ascr + a,
                        lscr: pen + s,
                        ef,
                        alpha: WORST_SCORE,
                        beta: WORST_SCORE,
                        best_prev: None,
                        bypass: true,
                        suppressed: false,
                    });
                }
            }
        }
        if self.links.len() + new_links.len() > max_edges {
            return Err(DecodeError::LatticeTooLarge {
                edges: self.links.len() + new_links.len(),
                max: max_edges,
            });
        }
        // Suppress every link touching a filler node, then splice in the
        // bypasses, merging parallel ones onto the best.
        for link in &mut self.links {
            if link.suppressed {
                continue;
            }
            let from_filler = {
                let id = link.from;
                self.dict.is_filler(self.nodes[id as usize].wid)
                    && id != self.start
                    && id != self.end
            };
            let to_filler = {
                let id = link.to;
                self.dict.is_filler(self.nodes[id as usize].wid)
                    && id != self.start
                    && id != self.end
            };
            if from_filler || to_filler {
                link.suppressed = true;
            }
        }
        let mut existing: HashMap<(LatNodeId, LatNodeId), LinkId> = HashMap::new();
        for (i, l) in self.links.iter().enumerate() {
            if !l.suppressed {
                existing.insert((l.from, l.to), i as LinkId);
            }
        }
        let mut added = 0usize;
        for link in new_links {
            match existing.get(&(link.from, link.to)) {
                Some(&i) => {
                    let old = &mut self.links[i as usize];
                    if link.ascr + link.lscr > old.ascr + old.lscr {
                        old.ascr = link.ascr;
                        old.lscr = link.lscr;
                        old.ef = link.ef;
                    }
                }
                None => {
                    let id = self.links.len() as LinkId;
                    existing.insert((link.from, link.to), id);
                    self.nodes[link.from as usize].out_links.push(id);
                    self.nodes[link.to as usize].in_links.push(id);
                    self.links.push(link);
                    added += 1;
                }
            }
        }
        self.norm = None;
        debug!(added, "filler bypass links inserted");
        Ok(())
    }

    /// Undo `bypass_fillers`.
    pub fn remove_bypass(&mut self) {
        let dead: Vec<LinkId> = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.bypass)
            .map(|(i, _)| i as LinkId)
            .collect();
        if dead.is_empty() && self.links.iter().all(|l| !l.suppressed) {
            return;
        }
        for node in &mut self.nodes {
            node.in_links.retain(|l| !dead.contains(l));
            node.out_links.retain(|l| !dead.contains(l));
        }
        // Drop from the tail so retained ids stay valid; bypass links were
        // appended after all originals.
        for &l in dead.iter().rev() {
            debug_assert_eq!(l as usize, self.links.len() - 1);
            self.links.pop();
        }
        for link in &mut self.links {
            link.suppressed = false;
        }
        self.norm = None;
    }

    /// Forward-backward over the live links. After this every link holds its
    /// alpha and beta and [`Lattice::posterior`] is meaningful.
    pub fn compute_posteriors(&mut self) -> Score {
        let order = self.topo_order();
        let n = self.nodes.len();
        let mut alpha = vec![WORST_SCORE; n];
        let mut beta = vec![WORST_SCORE; n];
        alpha[self.start as usize] = 0;
        for &u in &order {
            if alpha[u as usize] <= WORST_SCORE {
                continue;
            }
            let links: Vec<LinkId> = self.nodes[u as usize].out_links.clone();
            for l in links {
                if self.links[l as usize].suppressed {
                    continue;
                }
                let link = &self.links[l as usize];
                let la = alpha[u as usize] + link.ascr + link.lscr;
                let v = link.to as usize;
                self.links[l as usize].alpha = la;
                alpha[v] = self.logmath.add(alpha[v], la);
            }
        }
        beta[self.end as usize] = 0;
        for &u in order.iter().rev() {
            for &l in &self.nodes[u as usize].out_links {
                let link = &self.links[l as usize];
                if link.suppressed || beta[link.to as usize] <= WORST_SCORE {
                    continue;
                }
                let contrib = link.ascr + link.lscr + beta[link.to as usize];
                beta[u as usize] = self.logmath.add(beta[u as usize], contrib);
            }
            for &l in &self.nodes[u as usize].out_links {
                let to = self.links[l as usize].to as usize;
                self.links[l as usize].beta = beta[to];
            }
        }
        let norm = alpha[self.end as usize];
        self.norm = Some(norm);
        norm
    }

    /// Log posterior of a link; requires `compute_posteriors` first.
    pub fn posterior(&self, link: LinkId) -> Score {
        let norm = self.norm.expect("compute_posteriors first");
        let l = &self.links[link as usize];
        l.alpha + l.beta - norm
    }

    /// Best path under an external LM, walking links in topological order
    /// and rescoring each transition with the history of the chosen
    /// predecessor link. Returns one segment per traversed word (the start
    /// sentinel excluded).
    pub fn best_path(&mut self, lm: &dyn LanguageModel) -> Result<Vec<LatSegment>> {
        let dict = self.dict.clone();
        let dict2lm = move |wid: WordId| -> LmWordId {
            lm.word_id(dict.text(dict.base_wid(wid)))
                .unwrap_or(NO_LM_WORD)
        };
        let order = self.topo_order();
        let mut score: Vec<Score> = vec![WORST_SCORE; self.links.len()];
        for link in &mut self.links {
            link.best_prev = None;
        }

        for &u in &order {
            let u_wid = self.nodes[u as usize].wid;
            let u_lm = dict2lm(u_wid);
            let out: Vec<LinkId> = self.nodes[u as usize].out_links.clone();
            for l in out {
                if self.links[l as usize].suppressed {
                    continue;
                }
                let to = self.links[l as usize].to;
                let w_lm = dict2lm(self.nodes[to as usize].wid);
                if u == self.start {
                    score[l as usize] = self.links[l as usize].ascr
                        + trigram_score(lm, w_lm, lm.start_id(), NO_LM_WORD);
                    continue;
                }
                let mut best = WORST_SCORE;
                let mut best_prev = None;
                for &pl in &self.nodes[u as usize].in_links {
                    if self.links[pl as usize].suppressed
                        || score[pl as usize] <= WORST_SCORE
                    {
                        continue;
                    }
                    let h1 = dict2lm(self.nodes[self.links[pl as usize].from as usize].wid);
                    let s = score[pl as usize] + trigram_score(lm, w_lm, u_lm, h1);
                    if s > best {
                        best = s;
                        best_prev = Some(pl);
                    }
                }
                if best > WORST_SCORE {
                    score[l as usize] = best + self.links[l as usize].ascr;
                    self.links[l as usize].best_prev = best_prev;
                }
            }
        }

        let mut final_link = None;
        let mut best = WORST_SCORE;
        for &l in &self.nodes[self.end as usize].in_links {
            if !self.links[l as usize].suppressed && score[l as usize] > best {
                best = score[l as usize];
                final_link = Some(l);
            }
        }
        let mut segments = Vec::new();
        let mut cur = final_link.ok_or(DecodeError::EmptyUtterance)?;
        loop {
            let link = &self.links[cur as usize];
            let node = &self.nodes[link.to as usize];
            segments.push(LatSegment {
                wid: node.wid,
                sf: node.sf,
                ef: link.ef,
                ascr: link.ascr,
                lscr: link.lscr,
            });
            match link.best_prev {
                Some(p) => cur = p,
                None => break,
            }
        }
        segments.reverse();
        Ok(segments)
    }

    /// Text dump: nodes then links, one per line, space-separated.
    pub fn dump(&self, w: &mut impl Write) -> Result<()> {
        writeln!(w, "# frames {}", self.n_frames)?;
        writeln!(w, "# nodes {}", self.nodes.len())?;
        for (i, n) in self.nodes.iter().enumerate() {
            writeln!(
                w,
                "{} {} {} {} {}",
                i,
                self.dict.text(n.wid),
                n.sf,
                n.min_ef,
                n.max_ef
            )?;
        }
        writeln!(w, "# links {}", self.links.len())?;
        for l in self.links.iter().filter(|l| !l.suppressed) {
            writeln!(w, "{} {} {} {} {}", l.from, l.to, l.ascr, l.lscr, l.ef)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::tests::toy_mdef;
    use crate::dict2pid::PhoneIdMap;
    use crate::lm::{FillerPenalties, TableLm, TableLmBuilder};
    use crate::vithist::LmContext;
    use std::io;

    struct World {
        dict: Arc<Dictionary>,
        d2p: Arc<PhoneIdMap>,
        lm: Arc<TableLm>,
        fillpen: FillerPenalties,
        dict2lm: Vec<LmWordId>,
        lmath: Arc<LogMath>,
    }

    fn world() -> World {
        let lmath = LogMath::new(1.0001).unwrap();
        let mdef = toy_mdef();
        let main = io::Cursor::new("HELLO B AH\nWORLD F AY V\n");
        let dict = Arc::new(
            Dictionary::from_readers(mdef.clone(), main, None::<io::Empty>).unwrap(),
        );
        let d2p = PhoneIdMap::build(mdef, &dict);
        let mut b = TableLmBuilder::new(lmath.clone(), 1.0, 1.0);
        b.unigram("HELLO", 0.4, 1.0)
            .unigram("WORLD", 0.4, 1.0)
            .bigram("<s>", "HELLO", 0.9, 1.0)
            .bigram("HELLO", "WORLD", 0.9, 1.0);
        let lm = b.build();
        let fillpen = FillerPenalties::new(&lmath, &dict, 0.1, 0.05, 1.0);
        let dict2lm = (0..dict.len() as WordId)
            .map(|w| lm.word_id(dict.text(w)).unwrap_or(NO_LM_WORD))
            .collect();
        World {
            dict,
            d2p,
            lm,
            fillpen,
            dict2lm,
            lmath,
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

        /// hello (frames 0..=4) then world (5..=9), with a silence
        /// alternative for world's span and one dead-end exit.
        fn history(&self) -> (ViterbiHistory, HistId) {
            let hello = self.dict.word_id("HELLO").unwrap();
            let world = self.dict.word_id("WORLD").unwrap();
            let sil = self.dict.silence_wid();
            let mut vh = ViterbiHistory::new(-1_000_000);
            vh.utt_begin(self.dict.start_wid(), self.lm.start_id());
            for f in 0..4 {
                vh.frame_windup(f);
            }
            vh.rescore(&self.ctx(), hello, 4, -4000, 0, 0);
            let hello_id = vh.frame_range(4).start as HistId;
            vh.frame_windup(4);
            for f in 5..9 {
                vh.frame_windup(f);
            }
            vh.rescore(&self.ctx(), world, 9, vh.entry(hello_id).score - 4000, hello_id, 0);
            vh.rescore(&self.ctx(), sil, 9, vh.entry(hello_id).score - 4500, hello_id, 0);
            vh.frame_windup(9);
            let exit = vh.final_result(&self.ctx()).unwrap();
            (vh, exit)
        }
    }

    #[test]
    fn build_prunes_dead_ends() {
        let w = world();
        let (vh, exit) = w.history();
        let mut lat = Lattice::build(w.dict.clone(), w.lmath.clone(), &vh, exit);
        // <s>, HELLO, WORLD, <sil>(dead end, pruned), </s>.
        // The silence exit has no path to </s> so it is gone.
        let words: Vec<&str> = (0..lat.n_nodes() as LatNodeId)
            .map(|n| w.dict.text(lat.node(n).wid))
            .collect();
        assert!(words.contains(&"HELLO"));
        assert!(words.contains(&"WORLD"));
        assert!(!words.contains(&"<sil>"));
        // Lattice closure: every node reaches the end and is reached.
        assert_eq!(lat.n_nodes(), 4);
        let segs = lat.best_path(&*w.lm).unwrap();
        let path: Vec<&str> = segs.iter().map(|s| w.dict.text(s.wid)).collect();
        assert_eq!(path, vec!["HELLO", "WORLD", "</s>"]);
        assert_eq!(segs[0].sf, 0);
        assert_eq!(segs[0].ef, 4);
        assert_eq!(segs[1].sf, 5);
        assert_eq!(segs[1].ef, 9);
    }

    #[test]
    fn posteriors_sum_to_one_over_start_links() {
        let w = world();
        let (vh, exit) = w.history();
        let mut lat = Lattice::build(w.dict.clone(), w.lmath.clone(), &vh, exit);
        lat.compute_posteriors();
        let start = lat.start();
        let mut total = 0.0f64;
        for &l in &lat.node(start).out_links {
            total += w.lmath.exp(lat.posterior(l));
        }
        assert!((total - 1.0).abs() < 1e-3, "posterior sum {total}");
    }

    #[test]
    fn bypass_hides_fillers_and_restores() {
        let w = world();
        let hello = w.dict.word_id("HELLO").unwrap();
        let world_w = w.dict.word_id("WORLD").unwrap();
        let sil = w.dict.silence_wid();
        // hello -> <sil> -> world so the filler sits mid-path.
        let mut vh = ViterbiHistory::new(-1_000_000);
        vh.utt_begin(w.dict.start_wid(), w.lm.start_id());
        vh.rescore(&w.ctx(), hello, 0, -100, 0, 0);
        let hello_id = vh.frame_range(0).start as HistId;
        vh.frame_windup(0);
        vh.rescore(&w.ctx(), sil, 1, vh.entry(hello_id).score - 100, hello_id, 0);
        let sil_id = vh.frame_range(1).start as HistId;
        vh.frame_windup(1);
        vh.rescore(&w.ctx(), world_w, 2, vh.entry(sil_id).score - 100, sil_id, 0);
        vh.frame_windup(2);
        let exit = vh.final_result(&w.ctx()).unwrap();

        let mut lat = Lattice::build(w.dict.clone(), w.lmath.clone(), &vh, exit);
        let links_before = lat.n_links();
        lat.bypass_fillers(1.0, 10_000).unwrap();
        // No live path touches the silence any more.
        let segs = lat.best_path(&*w.lm).unwrap();
        assert!(segs.iter().all(|s| s.wid != sil));
        assert!(segs.iter().any(|s| s.wid == world_w));

        lat.remove_bypass();
        assert_eq!(lat.n_links(), links_before);
        assert!(lat.links.iter().all(|l| !l.suppressed));

        // A tiny edge budget trips the guard.
        assert!(matches!(
            lat.bypass_fillers(1.0, 1),
            Err(DecodeError::LatticeTooLarge { .. })
        ));
    }
}
