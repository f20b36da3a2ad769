//! In-memory model definition: the CI phone table, the triphone table with
//! its senone sequences and transition matrices, and the context lookup the
//! cross-word machinery is built on.
//!
//! Binary model files are an external concern; models are assembled through
//! [`ModelDefBuilder`] from whatever reader the caller uses.
use crate::error::{DecodeError, Result};
use crate::logmath::{LogMath, Score, WORST_SCORE};
use ndarray::Array2;
use std::collections::HashMap;
use std::sync::Arc;

pub type CiPhoneId = u16;
pub const NO_CIPHONE: CiPhoneId = u16::MAX;

pub type PhoneId = u32;
pub const NO_PHONE: PhoneId = u32::MAX;

pub type SseqId = u32;
pub const NO_SSEQ: SseqId = u32::MAX;

pub type SenId = u32;
pub const NO_SENONE: SenId = u32::MAX;

pub type TmatId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordPosition {
    Begin,
    Internal,
    End,
    Single,
}

#[derive(Debug, Clone)]
pub struct CiPhone {
    pub name: String,
    pub filler: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Phone {
    pub base: CiPhoneId,
    pub lc: CiPhoneId,
    pub rc: CiPhoneId,
    pub position: WordPosition,
    pub sseq: SseqId,
    pub tmat: TmatId,
}

/// Model definition. Immutable once built; shared behind an [`Arc`] by the
/// dictionary, the context map, the trees and the aligner.
#[derive(Debug)]
pub struct ModelDef {
    ci: Vec<CiPhone>,
    ci_index: HashMap<String, CiPhoneId>,
    /// All phones. The first `ci.len()` entries are the CI phones themselves.
    phones: Vec<Phone>,
    tri_index: HashMap<(CiPhoneId, CiPhoneId, CiPhoneId, WordPosition), PhoneId>,
    /// `sseq[id]` is the senone per emitting state.
    sseq: Vec<Vec<SenId>>,
    /// Transition matrices in log domain, `(n_emit, n_emit + 1)`; the last
    /// column is the non-emitting exit.
    tmat: Vec<Array2<Score>>,
    n_emit: usize,
    n_senone: usize,
    silence: CiPhoneId,
}

impl ModelDef {
    pub fn n_ciphone(&self) -> usize {
        self.ci.len()
    }

    pub fn n_phone(&self) -> usize {
        self.phones.len()
    }

    pub fn n_sseq(&self) -> usize {
        self.sseq.len()
    }

    pub fn n_senone(&self) -> usize {
        self.n_senone
    }

    pub fn n_emit_state(&self) -> usize {
        self.n_emit
    }

    pub fn silence_phone(&self) -> CiPhoneId {
        self.silence
    }

    pub fn ciphone_id(&self, name: &str) -> Option<CiPhoneId> {
        self.ci_index.get(name).copied()
    }

    pub fn ciphone_name(&self, ci: CiPhoneId) -> &str {
        &self.ci[ci as usize].name
    }

    pub fn is_filler_phone(&self, ci: CiPhoneId) -> bool {
        self.ci[ci as usize].filler
    }

    pub fn phone(&self, id: PhoneId) -> &Phone {
        &self.phones[id as usize]
    }

    pub fn phone_sseq(&self, id: PhoneId) -> SseqId {
        self.phones[id as usize].sseq
    }

    pub fn phone_tmat(&self, id: PhoneId) -> TmatId {
        self.phones[id as usize].tmat
    }

    /// Senone sequence id of a CI phone used as its own model.
    pub fn ci_sseq(&self, ci: CiPhoneId) -> SseqId {
        self.phones[ci as usize].sseq
    }

    pub fn ci_tmat(&self, ci: CiPhoneId) -> TmatId {
        self.phones[ci as usize].tmat
    }

    pub fn sseq_senones(&self, sseq: SseqId) -> &[SenId] {
        &self.sseq[sseq as usize]
    }

    pub fn tmat(&self, id: TmatId) -> &Array2<Score> {
        &self.tmat[id as usize]
    }

    /// Exact triphone lookup.
    pub fn phone_id(
        &self,
        base: CiPhoneId,
        lc: CiPhoneId,
        rc: CiPhoneId,
        position: WordPosition,
    ) -> Option<PhoneId> {
        self.tri_index.get(&(base, lc, rc, position)).copied()
    }

    /// Triphone lookup with back-off: the exact triphone, then the same
    /// contexts in any other word position, then silence in place of either
    /// context, and finally the bare CI phone. Mirrors how sparse triphone
    /// inventories are patched over at build time.
    pub fn phone_id_nearest(
        &self,
        base: CiPhoneId,
        lc: CiPhoneId,
        rc: CiPhoneId,
        position: WordPosition,
    ) -> PhoneId {
        if let Some(p) = self.phone_id(base, lc, rc, position) {
            return p;
        }
        for pos in [
            WordPosition::Internal,
            WordPosition::Begin,
            WordPosition::End,
            WordPosition::Single,
        ] {
            if pos == position {
                continue;
            }
            if let Some(p) = self.phone_id(base, lc, rc, pos) {
                return p;
            }
        }
        let sil = self.silence;
        if let Some(p) = self.phone_id(base, lc, sil, position) {
            return p;
        }
        if let Some(p) = self.phone_id(base, sil, rc, position) {
            return p;
        }
        base as PhoneId
    }

    /// Lowest transition score in any matrix; used by monotonicity checks.
    pub fn min_transition(&self) -> Score {
        self.tmat
            .iter()
            .flat_map(|t| t.iter().copied())
            .filter(|&s| s > WORST_SCORE)
            .min()
            .unwrap_or(WORST_SCORE)
    }
}

/// Assembles a [`ModelDef`]. Senone sequences are deduplicated as they are
/// added, so two triphones with the same tied states share one `SseqId`.
pub struct ModelDefBuilder {
    n_emit: usize,
    ci: Vec<CiPhone>,
    ci_index: HashMap<String, CiPhoneId>,
    phones: Vec<Phone>,
    tri_index: HashMap<(CiPhoneId, CiPhoneId, CiPhoneId, WordPosition), PhoneId>,
    sseq: Vec<Vec<SenId>>,
    sseq_index: HashMap<Vec<SenId>, SseqId>,
    tmat_rows: Vec<Vec<Vec<f64>>>,
}

impl ModelDefBuilder {
    pub fn new(n_emit: usize) -> Self {
        Self {
            n_emit,
            ci: Vec::new(),
            ci_index: HashMap::new(),
            phones: Vec::new(),
            tri_index: HashMap::new(),
            sseq: Vec::new(),
            sseq_index: HashMap::new(),
            tmat_rows: Vec::new(),
        }
    }

    /// Register a transition matrix from linear probabilities, one row per
    /// emitting state, each row `n_emit + 1` wide (the extra column is the
    /// exit transition).
    pub fn add_tmat(&mut self, rows: Vec<Vec<f64>>) -> Result<TmatId> {
        if rows.len() != self.n_emit || rows.iter().any(|r| r.len() != self.n_emit + 1) {
            return Err(DecodeError::Config(format!(
                "transition matrix must be {} x {}",
                self.n_emit,
                self.n_emit + 1
            )));
        }
        self.tmat_rows.push(rows);
        Ok(self.tmat_rows.len() as TmatId - 1)
    }

    fn intern_sseq(&mut self, senones: Vec<SenId>) -> Result<SseqId> {
        if senones.len() != self.n_emit {
            return Err(DecodeError::Config(format!(
                "senone sequence must have {} states, got {}",
                self.n_emit,
                senones.len()
            )));
        }
        if let Some(&id) = self.sseq_index.get(&senones) {
            return Ok(id);
        }
        let id = self.sseq.len() as SseqId;
        self.sseq_index.insert(senones.clone(), id);
        self.sseq.push(senones);
        Ok(id)
    }

    /// Add a CI phone together with its own (context-independent) model.
    pub fn add_ciphone(
        &mut self,
        name: &str,
        filler: bool,
        senones: Vec<SenId>,
        tmat: TmatId,
    ) -> Result<CiPhoneId> {
        if self.ci_index.contains_key(name) {
            return Err(DecodeError::Config(format!("duplicate CI phone {name}")));
        }
        if !self.phones.is_empty() && self.phones.len() != self.ci.len() {
            return Err(DecodeError::Config(
                "all CI phones must be added before any triphone".into(),
            ));
        }
        let id = self.ci.len() as CiPhoneId;
        let sseq = self.intern_sseq(senones)?;
        self.ci.push(CiPhone {
            name: name.to_string(),
            filler,
        });
        self.ci_index.insert(name.to_string(), id);
        self.phones.push(Phone {
            base: id,
            lc: NO_CIPHONE,
            rc: NO_CIPHONE,
            position: WordPosition::Internal,
            sseq,
            tmat,
        });
        Ok(id)
    }

    pub fn add_triphone(
        &mut self,
        base: CiPhoneId,
        lc: CiPhoneId,
        rc: CiPhoneId,
        position: WordPosition,
        senones: Vec<SenId>,
        tmat: TmatId,
    ) -> Result<PhoneId> {
        let key = (base, lc, rc, position);
        if self.tri_index.contains_key(&key) {
            return Err(DecodeError::Config(format!(
                "duplicate triphone ({base}, {lc}, {rc}, {position:?})"
            )));
        }
        let sseq = self.intern_sseq(senones)?;
        let id = self.phones.len() as PhoneId;
        self.phones.push(Phone {
            base,
            lc,
            rc,
            position,
            sseq,
            tmat,
        });
        self.tri_index.insert(key, id);
        Ok(id)
    }

    pub fn build(self, logmath: &LogMath) -> Result<Arc<ModelDef>> {
        let silence = self
            .ci_index
            .get("SIL")
            .copied()
            .ok_or_else(|| DecodeError::Config("model definition has no SIL phone".into()))?;
        let n_senone = self
            .sseq
            .iter()
            .flat_map(|s| s.iter())
            .map(|&s| s as usize + 1)
            .max()
            .unwrap_or(0);
        if self.tmat_rows.is_empty() {
            return Err(DecodeError::Config(
                "model definition has no transition matrices".into(),
            ));
        }
        let n_emit = self.n_emit;
        let tmat = self
            .tmat_rows
            .into_iter()
            .map(|rows| {
                Array2::from_shape_fn((n_emit, n_emit + 1), |(f, t)| logmath.log(rows[f][t]))
            })
            .collect();
        Ok(Arc::new(ModelDef {
            ci: self.ci,
            ci_index: self.ci_index,
            phones: self.phones,
            tri_index: self.tri_index,
            sseq: self.sseq,
            tmat,
            n_emit,
            n_senone,
            silence,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> Arc<ModelDef> {
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
        let bb = b.add_ciphone("B", false, vec![6, 7, 8], t).unwrap();
        b.add_triphone(aa, sil, bb, WordPosition::Begin, vec![9, 10, 11], t)
            .unwrap();
        b.add_triphone(aa, bb, sil, WordPosition::End, vec![9, 10, 12], t)
            .unwrap();
        b.build(&lmath).unwrap()
    }

    #[test]
    fn ciphones_are_their_own_models() {
        let m = toy();
        assert_eq!(m.n_ciphone(), 3);
        let aa = m.ciphone_id("AA").unwrap();
        assert_eq!(m.sseq_senones(m.ci_sseq(aa)), &[3, 4, 5]);
        assert!(m.is_filler_phone(m.silence_phone()));
    }

    #[test]
    fn exact_lookup_and_fallback() {
        let m = toy();
        let sil = m.silence_phone();
        let aa = m.ciphone_id("AA").unwrap();
        let bb = m.ciphone_id("B").unwrap();
        let exact = m.phone_id(aa, sil, bb, WordPosition::Begin).unwrap();
        assert_eq!(m.sseq_senones(m.phone_sseq(exact)), &[9, 10, 11]);
        // Missing triphone falls back to another position, then CI.
        let near = m.phone_id_nearest(aa, bb, sil, WordPosition::Single);
        assert_eq!(m.sseq_senones(m.phone_sseq(near)), &[9, 10, 12]);
        let ci = m.phone_id_nearest(bb, aa, aa, WordPosition::Single);
        assert_eq!(ci, bb as PhoneId);
    }

    #[test]
    fn sseq_dedup() {
        let m = toy();
        // 3 CI sequences + 2 triphone sequences, with no duplicates created.
        assert_eq!(m.n_sseq(), 5);
        assert_eq!(m.n_senone(), 13);
    }
}
