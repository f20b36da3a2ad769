//! Cross-word triphone identity map.
//!
//! The first and last phones of a word take their outer context from
//! neighbouring words, which are not known until search time. This table
//! precomputes every senone sequence those boundary phones can take:
//!
//! - word-internal phones are fully determined by the pronunciation,
//! - the first phone of a multi-phone word is indexed by its own phone, the
//!   second phone and the incoming left context,
//! - the last phone fans out over every possible right context, compressed to
//!   the distinct senone sequences plus an index from right context to slot,
//! - single-phone words fan out over both contexts at once.
//!
//! The compression is what keeps cross-word expansion affordable: most right
//! contexts collapse onto a handful of distinct tied-state sequences.
use crate::dict::{Dictionary, WordId};
use crate::mdef::{CiPhoneId, ModelDef, SseqId, WordPosition, NO_SSEQ};
use ndarray::Array3;
use std::sync::Arc;
use tracing::info;

/// Compressed right-context fan-out for one `(base, left-context)` pair:
/// `sseq` holds the distinct senone sequences and `ctx_map[rc]` the slot for
/// every right-context CI phone.
#[derive(Debug, Clone, Default)]
pub struct XwSseq {
    pub sseq: Vec<SseqId>,
    pub ctx_map: Vec<u16>,
}

#[derive(Debug)]
pub struct PhoneIdMap {
    mdef: Arc<ModelDef>,
    /// `internal[wid][pos]`: senone sequence for word-internal positions;
    /// `NO_SSEQ` at the word boundaries which live in the tables below.
    internal: Vec<Vec<SseqId>>,
    /// `[base, second-phone, left-context]` for the first phone of
    /// multi-phone words.
    ldiph_lc: Array3<SseqId>,
    /// `[base, left-context, right-context]` for the last phone of
    /// multi-phone words, uncompressed; kept only long enough to compress.
    /// `[base][left-context]` compressed right contexts of final phones.
    rssid: Vec<Vec<XwSseq>>,
    /// `[base, left-context, right-context]` for single-phone words.
    lrdiph_rc: Array3<SseqId>,
    /// `[base][left-context]` compressed right contexts of single-phone
    /// words.
    lrssid: Vec<Vec<XwSseq>>,
}

/// First-occurrence compression of an uncompressed `rc -> sseq` row.
fn compress_row(uncompressed: &[SseqId]) -> XwSseq {
    let mut out = XwSseq {
        sseq: Vec::new(),
        ctx_map: vec![0; uncompressed.len()],
    };
    for (r, &ssid) in uncompressed.iter().enumerate() {
        match out.sseq.iter().position(|&s| s == ssid) {
            Some(slot) => out.ctx_map[r] = slot as u16,
            None => {
                out.ctx_map[r] = out.sseq.len() as u16;
                out.sseq.push(ssid);
            }
        }
    }
    out
}

impl PhoneIdMap {
    pub fn build(mdef: Arc<ModelDef>, dict: &Dictionary) -> Arc<Self> {
        let n_ci = mdef.n_ciphone();
        let mut internal = Vec::with_capacity(dict.len());
        let mut ldiph_lc = Array3::from_elem((n_ci, n_ci, n_ci), NO_SSEQ);
        let mut rdiph_rc = Array3::from_elem((n_ci, n_ci, n_ci), NO_SSEQ);
        let mut lrdiph_rc = Array3::from_elem((n_ci, n_ci, n_ci), NO_SSEQ);
        let mut ldiph_done = vec![false; n_ci * n_ci];
        let mut rdiph_done = vec![false; n_ci * n_ci];
        let mut single_done = vec![false; n_ci];

        for wid in 0..dict.len() as WordId {
            let pron = dict.pronunciation(wid);
            let mut row = vec![NO_SSEQ; pron.len()];
            if pron.len() >= 2 {
                let b = pron[0] as usize;
                let r = pron[1] as usize;
                if !ldiph_done[b * n_ci + r] {
                    ldiph_done[b * n_ci + r] = true;
                    for l in 0..n_ci {
                        let p = mdef.phone_id_nearest(
                            b as CiPhoneId,
                            l as CiPhoneId,
                            r as CiPhoneId,
                            WordPosition::Begin,
                        );
                        ldiph_lc[(b, r, l)] = mdef.phone_sseq(p);
                    }
                }
                for pos in 1..pron.len() - 1 {
                    let p = mdef.phone_id_nearest(
                        pron[pos],
                        pron[pos - 1],
                        pron[pos + 1],
                        WordPosition::Internal,
                    );
                    row[pos] = mdef.phone_sseq(p);
                }
                let b = *pron.last().unwrap() as usize;
                let l = pron[pron.len() - 2] as usize;
                if !rdiph_done[b * n_ci + l] {
                    rdiph_done[b * n_ci + l] = true;
                    for r in 0..n_ci {
                        let p = mdef.phone_id_nearest(
                            b as CiPhoneId,
                            l as CiPhoneId,
                            r as CiPhoneId,
                            WordPosition::End,
                        );
                        rdiph_rc[(b, l, r)] = mdef.phone_sseq(p);
                    }
                }
            } else {
                let b = pron[0] as usize;
                if !single_done[b] {
                    single_done[b] = true;
                    for l in 0..n_ci {
                        for r in 0..n_ci {
                            let p = mdef.phone_id_nearest(
                                b as CiPhoneId,
                                l as CiPhoneId,
                                r as CiPhoneId,
                                WordPosition::Single,
                            );
                            lrdiph_rc[(b, l, r)] = mdef.phone_sseq(p);
                        }
                    }
                }
            }
            internal.push(row);
        }

        // Rows never touched by the vocabulary stay NO_SSEQ and compress to
        // an empty fan-out; lookups only ever come through words that filled
        // their row in.
        let compress = |table: &Array3<SseqId>| -> Vec<Vec<XwSseq>> {
            (0..n_ci)
                .map(|b| {
                    (0..n_ci)
                        .map(|l| {
                            let row: Vec<SseqId> =
                                (0..n_ci).map(|r| table[(b, l, r)]).collect();
                            if row[0] == NO_SSEQ {
                                XwSseq::default()
                            } else {
                                compress_row(&row)
                            }
                        })
                        .collect()
                })
                .collect()
        };
        let rssid = compress(&rdiph_rc);
        let lrssid = compress(&lrdiph_rc);

        let stored: usize = rssid
            .iter()
            .chain(lrssid.iter())
            .flat_map(|row| row.iter())
            .map(|x| x.sseq.len())
            .sum();
        info!(words = dict.len(), stored_xw_sseq = stored, "phone identity map built");

        Arc::new(Self {
            mdef,
            internal,
            ldiph_lc,
            rssid,
            lrdiph_rc,
            lrssid,
        })
    }

    pub fn mdef(&self) -> &Arc<ModelDef> {
        &self.mdef
    }

    /// Senone sequence of a word-internal phone position.
    pub fn internal_sseq(&self, wid: WordId, pos: usize) -> SseqId {
        self.internal[wid as usize][pos]
    }

    /// First phone of a multi-phone word under an incoming left context.
    pub fn ldiph(&self, base: CiPhoneId, second: CiPhoneId, lc: CiPhoneId) -> SseqId {
        self.ldiph_lc[(base as usize, second as usize, lc as usize)]
    }

    /// Compressed right-context fan-out of a multi-phone word's final phone.
    pub fn rssid(&self, base: CiPhoneId, lc: CiPhoneId) -> &XwSseq {
        &self.rssid[base as usize][lc as usize]
    }

    /// Single-phone word under a known left context.
    pub fn lrdiph(&self, base: CiPhoneId, lc: CiPhoneId, rc: CiPhoneId) -> SseqId {
        self.lrdiph_rc[(base as usize, lc as usize, rc as usize)]
    }

    /// Compressed right-context fan-out of a single-phone word.
    pub fn lrssid(&self, base: CiPhoneId, lc: CiPhoneId) -> &XwSseq {
        &self.lrssid[base as usize][lc as usize]
    }

    /// Right-context map for a word's final phone: `map[rc] -> slot`. For a
    /// single-phone word the fan-out depends on the incoming left context
    /// `lc`; multi-phone words take it from their own penultimate phone.
    pub fn rc_map(&self, dict: &Dictionary, wid: WordId, lc: CiPhoneId) -> &[u16] {
        let pron = dict.pronunciation(wid);
        let b = *pron.last().unwrap();
        if pron.len() == 1 {
            &self.lrssid[b as usize][lc as usize].ctx_map
        } else {
            let lc = pron[pron.len() - 2];
            &self.rssid[b as usize][lc as usize].ctx_map
        }
    }

    /// Number of distinct right-context senone sequences of a word's final
    /// phone under left context `lc` (only single-phone words use it).
    pub fn rc_count(&self, dict: &Dictionary, wid: WordId, lc: CiPhoneId) -> usize {
        let pron = dict.pronunciation(wid);
        let b = *pron.last().unwrap();
        if pron.len() == 1 {
            self.lrssid[b as usize][lc as usize].sseq.len()
        } else {
            let lc = pron[pron.len() - 2];
            self.rssid[b as usize][lc as usize].sseq.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::tests::toy_mdef;
    use crate::logmath::LogMath;
    use crate::mdef::ModelDefBuilder;
    use std::io;

    #[test]
    fn compress_drops_duplicates_and_maps_every_context() {
        let row = vec![7, 3, 7, 7, 3, 9];
        let xw = compress_row(&row);
        assert_eq!(xw.sseq, vec![7, 3, 9]);
        assert_eq!(xw.ctx_map, vec![0, 1, 0, 0, 1, 2]);
        // ctx_map is total and surjective onto the slot set.
        for slot in 0..xw.sseq.len() as u16 {
            assert!(xw.ctx_map.contains(&slot));
        }
    }

    #[test]
    fn ci_only_model_collapses_to_one_slot() {
        // Without any triphones every right context backs off to the CI
        // phone, so compression keeps exactly one sseq per final phone.
        let mdef = toy_mdef();
        let main = io::Cursor::new("FIVE F AY V\nA AH\n");
        let dict = Dictionary::from_readers(mdef.clone(), main, None::<io::Empty>).unwrap();
        let d2p = PhoneIdMap::build(mdef, &dict);

        let sil = dict.mdef().silence_phone();
        let five = dict.word_id("FIVE").unwrap();
        assert_eq!(d2p.rc_count(&dict, five, sil), 1);
        assert!(d2p.rc_map(&dict, five, sil).iter().all(|&s| s == 0));
        let a = dict.word_id("A").unwrap();
        // CI only, so every left-context row of the single-phone word
        // collapses the same way.
        for lc in 0..dict.mdef().n_ciphone() as CiPhoneId {
            assert_eq!(d2p.rc_count(&dict, a, lc), 1);
        }
    }

    #[test]
    fn triphones_split_right_context_slots() {
        let lmath = LogMath::new(1.0001).unwrap();
        let mut b = ModelDefBuilder::new(3);
        let t = b
            .add_tmat(vec![
                vec![0.6, 0.4, 0.0, 0.0],
                vec![0.0, 0.6, 0.4, 0.0],
                vec![0.0, 0.0, 0.6, 0.4],
            ])
            .unwrap();
        let sil = b.add_ciphone("SIL", true, vec![0, 1, 2], t).unwrap();
        let aa = b.add_ciphone("AA", false, vec![3, 4, 5], t).unwrap();
        let kk = b.add_ciphone("K", false, vec![6, 7, 8], t).unwrap();
        // K at word end after AA: distinct models for right contexts SIL
        // and AA, while rc=K backs off to the SIL-context model via
        // phone_id_nearest.
        b.add_triphone(kk, aa, sil, WordPosition::End, vec![9, 10, 11], t)
            .unwrap();
        b.add_triphone(kk, aa, aa, WordPosition::End, vec![9, 10, 12], t)
            .unwrap();
        let mdef = b.build(&lmath).unwrap();

        let main = io::Cursor::new("OAK AA K\n");
        let dict = Dictionary::from_readers(mdef.clone(), main, None::<io::Empty>).unwrap();
        let d2p = PhoneIdMap::build(mdef, &dict);
        let oak = dict.word_id("OAK").unwrap();

        assert_eq!(d2p.rc_count(&dict, oak, sil), 2);
        let map = d2p.rc_map(&dict, oak, sil);
        assert_eq!(map[sil as usize], 0);
        assert_eq!(map[aa as usize], 1);
        assert_eq!(map[kk as usize], 0);
        let xw = d2p.rssid(kk, aa);
        // No duplicate sequences survive compression.
        let mut seen = xw.sseq.clone();
        seen.dedup();
        assert_eq!(seen.len(), xw.sseq.len());
    }

    #[test]
    fn single_phone_fanout_tracks_left_context() {
        let lmath = LogMath::new(1.0001).unwrap();
        let mut b = ModelDefBuilder::new(3);
        let t = b
            .add_tmat(vec![
                vec![0.6, 0.4, 0.0, 0.0],
                vec![0.0, 0.6, 0.4, 0.0],
                vec![0.0, 0.0, 0.6, 0.4],
            ])
            .unwrap();
        let sil = b.add_ciphone("SIL", true, vec![0, 1, 2], t).unwrap();
        let tt = b.add_ciphone("T", false, vec![3, 4, 5], t).unwrap();
        let aa = b.add_ciphone("AA", false, vec![6, 7, 8], t).unwrap();
        // T as a single-phone word: after SIL every right context backs off
        // onto one model, after AA the right contexts SIL and AA split.
        b.add_triphone(tt, sil, sil, WordPosition::Single, vec![9, 10, 11], t)
            .unwrap();
        b.add_triphone(tt, aa, sil, WordPosition::Single, vec![12, 13, 14], t)
            .unwrap();
        b.add_triphone(tt, aa, aa, WordPosition::Single, vec![12, 13, 15], t)
            .unwrap();
        let mdef = b.build(&lmath).unwrap();

        let main = io::Cursor::new("TEA T\n");
        let dict = Dictionary::from_readers(mdef.clone(), main, None::<io::Empty>).unwrap();
        let d2p = PhoneIdMap::build(mdef, &dict);
        let tea = dict.word_id("TEA").unwrap();

        // The fan-out and slot map differ between left-context rows.
        assert_eq!(d2p.rc_count(&dict, tea, sil), 1);
        assert_eq!(d2p.rc_count(&dict, tea, aa), 2);
        assert!(d2p.rc_map(&dict, tea, sil).iter().all(|&s| s == 0));
        let map_aa = d2p.rc_map(&dict, tea, aa);
        assert_eq!(map_aa[sil as usize], 0);
        assert_eq!(map_aa[tt as usize], 0);
        assert_eq!(map_aa[aa as usize], 1);
        assert_ne!(d2p.lrssid(tt, sil).sseq, d2p.lrssid(tt, aa).sseq);
        // And the accessor agrees with the per-context table the tree
        // expansion reads.
        assert_eq!(
            d2p.rc_count(&dict, tea, aa),
            d2p.lrssid(tt, aa).sseq.len()
        );
    }
}
