//! The decoder session.
//!
//! Owns the lifetime objects (log math, models, dictionary, context map,
//! LM, the acoustic scorer) and a registry of named searches, one of which
//! is active at a time. Audio or cepstra are fed in chunks between
//! `start_utt` and `end_utt`; the facade drives the active search one frame
//! at a time as features become available and exposes the results
//! afterwards.
//!
//! Errors below the facade are surfaced as return values. Recoverable ones
//! (an empty utterance, an oversized lattice) leave the session ready for
//! the next utterance; an internal invariant violation poisons the session
//! and is returned from every call from then on.
use crate::acmod::{AcousticScorer, FrontEnd};
use crate::astar::NBest;
use crate::config::DecoderConfig;
use crate::dict::Dictionary;
use crate::dict2pid::PhoneIdMap;
use crate::error::{DecodeError, Result};
use crate::gauden::Gauden;
use crate::hmm::Frame;
use crate::lattice::Lattice;
use crate::lm::LanguageModel;
use crate::logmath::{LogMath, Score};
use crate::mdef::ModelDef;
use crate::search::align::{Alignment, StateAlignSearch};
use crate::search::fwdtree::TreeSearch;
use crate::search::{Hypothesis, Search, Segment};
use crate::senone::SenoneSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_SEARCH: &str = "_default";
pub const ALIGN_SEARCH: &str = "_align";

/// The model bundle a session is built from. Readers for on-disk formats
/// live outside the crate; anything able to produce these structures works.
pub struct Models {
    pub mdef: Arc<ModelDef>,
    pub dict: Arc<Dictionary>,
    pub gauden: Gauden,
    pub senones: SenoneSet,
    pub lm: Arc<dyn LanguageModel>,
}

#[derive(Debug, Clone, Default)]
pub struct PerfCounters {
    pub utterances: u32,
    pub frames: u64,
    pub hmm_evals: u64,
    pub senone_evals: u64,
    pub word_exits: u64,
    pub decode_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UttState {
    Idle,
    Started,
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder").finish_non_exhaustive()
    }
}

pub struct Decoder {
    config: DecoderConfig,
    logmath: Arc<LogMath>,
    dict: Arc<Dictionary>,
    d2p: Arc<PhoneIdMap>,
    lm: Arc<dyn LanguageModel>,
    scorer: AcousticScorer,
    searches: HashMap<String, Box<dyn Search>>,
    active: String,
    front_end: Option<Box<dyn FrontEnd>>,
    state: UttState,
    frame: Frame,
    uttno: u32,
    counters: PerfCounters,
    utt_timer: Option<Instant>,
    poison: Option<String>,
}

impl Decoder {
    pub fn new(config: DecoderConfig, models: Models) -> Result<Self> {
        let Models {
            mdef,
            dict,
            gauden,
            senones,
            lm,
        } = models;
        if senones.n_senone() != mdef.n_senone() {
            return Err(DecodeError::ModelMismatch(format!(
                "model definition references {} senones, mixture weights cover {}",
                mdef.n_senone(),
                senones.n_senone()
            )));
        }
        if !Arc::ptr_eq(dict.mdef(), &mdef) {
            return Err(DecodeError::ModelMismatch(
                "dictionary was built against a different model definition".into(),
            ));
        }
        let logmath = LogMath::new(config.logbase)?;
        let d2p = PhoneIdMap::build(mdef, &dict);
        let scorer = AcousticScorer::new(&config, logmath.clone(), gauden, senones)?;

        let default = TreeSearch::new(
            DEFAULT_SEARCH,
            &config,
            logmath.clone(),
            dict.clone(),
            d2p.clone(),
            lm.clone(),
        )?;
        let mut searches: HashMap<String, Box<dyn Search>> = HashMap::new();
        searches.insert(DEFAULT_SEARCH.to_string(), Box::new(default));
        info!("decoder session ready");
        Ok(Self {
            config,
            logmath,
            dict,
            d2p,
            lm,
            scorer,
            searches,
            active: DEFAULT_SEARCH.to_string(),
            front_end: None,
            state: UttState::Idle,
            frame: 0,
            uttno: 0,
            counters: PerfCounters::default(),
            utt_timer: None,
            poison: None,
        })
    }

    fn check(&self) -> Result<()> {
        match &self.poison {
            Some(msg) => Err(DecodeError::InternalInvariant(msg.clone())),
            None => Ok(()),
        }
    }

    fn poison_check(&mut self, e: DecodeError) -> DecodeError {
        if !e.is_recoverable() {
            self.poison = Some(e.to_string());
        }
        e
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn logmath(&self) -> &Arc<LogMath> {
        &self.logmath
    }

    pub fn dict(&self) -> &Arc<Dictionary> {
        &self.dict
    }

    pub fn counters(&self) -> &PerfCounters {
        &self.counters
    }

    /// Plug a PCM front end so `process_raw` can be used.
    pub fn set_front_end(&mut self, fe: Box<dyn FrontEnd>) {
        self.front_end = Some(fe);
    }

    /// Register a named search. Replaces any search of the same name.
    pub fn add_search(&mut self, name: &str, search: Box<dyn Search>) {
        self.searches.insert(name.to_string(), search);
    }

    pub fn remove_search(&mut self, name: &str) -> Result<()> {
        if name == self.active {
            return Err(DecodeError::Config(format!(
                "cannot remove the active search {name}"
            )));
        }
        self.searches
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DecodeError::Config(format!("no search named {name}")))
    }

    pub fn set_search(&mut self, name: &str) -> Result<()> {
        if self.state != UttState::Idle {
            return Err(DecodeError::Config(
                "cannot switch searches mid-utterance".into(),
            ));
        }
        if !self.searches.contains_key(name) {
            return Err(DecodeError::Config(format!("no search named {name}")));
        }
        self.active = name.to_string();
        Ok(())
    }

    pub fn search_names(&self) -> impl Iterator<Item = &str> {
        self.searches.keys().map(|s| s.as_str())
    }

    pub fn active_search(&self) -> &str {
        &self.active
    }

    /// Set up forced alignment against a transcript and make it the active
    /// search.
    pub fn set_align_text(&mut self, transcript: &str) -> Result<()> {
        self.check()?;
        let alignment =
            Alignment::from_transcript(self.dict.clone(), self.d2p.clone(), transcript)?;
        let search = StateAlignSearch::new(ALIGN_SEARCH, alignment);
        self.add_search(ALIGN_SEARCH, Box::new(search));
        self.set_search(ALIGN_SEARCH)
    }

    pub fn start_utt(&mut self) -> Result<()> {
        self.check()?;
        if self.state != UttState::Idle {
            return Err(DecodeError::Config("utterance already started".into()));
        }
        self.uttno += 1;
        self.frame = 0;
        self.scorer.start_utt();
        let search = self
            .searches
            .get_mut(&self.active)
            .expect("active search exists");
        search.start(&mut self.scorer)?;
        self.state = UttState::Started;
        self.utt_timer = Some(Instant::now());
        info!(utt = self.uttno, search = %self.active, "utterance started");
        Ok(())
    }

    /// Feed pre-extracted cepstral frames.
    pub fn process_cep(&mut self, frames: &[Vec<f32>]) -> Result<()> {
        self.check()?;
        if self.state != UttState::Started {
            return Err(DecodeError::Config("no utterance in progress".into()));
        }
        self.scorer.process_cep(frames)?;
        self.drive()
    }

    /// Feed raw signed 16-bit mono PCM through the configured front end.
    pub fn process_raw(&mut self, samples: &[i16]) -> Result<()> {
        self.check()?;
        if self.state != UttState::Started {
            return Err(DecodeError::Config("no utterance in progress".into()));
        }
        let fe = self
            .front_end
            .as_mut()
            .ok_or_else(|| DecodeError::Config("no front end configured for raw PCM".into()))?;
        let mut cep = Vec::new();
        fe.process(samples, &mut cep);
        self.scorer.process_cep(&cep)?;
        self.drive()
    }

    /// Step the active search over every frame the scorer has ready.
    fn drive(&mut self) -> Result<()> {
        let search = self
            .searches
            .get_mut(&self.active)
            .expect("active search exists");
        while self.frame < self.scorer.frames_ready() {
            let stats = match search.step(&mut self.scorer, self.frame) {
                Ok(stats) => stats,
                Err(e) => {
                    if !e.is_recoverable() {
                        self.poison = Some(e.to_string());
                    }
                    return Err(e);
                }
            };
            self.counters.hmm_evals += stats.hmm_evals;
            self.counters.word_exits += stats.word_exits;
            // The second pass revisits frames, so they are only released
            // when it is off.
            if !self.config.flat_rescore {
                self.scorer.advance();
            }
            self.frame += 1;
        }
        Ok(())
    }

    pub fn end_utt(&mut self) -> Result<()> {
        self.check()?;
        if self.state != UttState::Started {
            return Err(DecodeError::Config("no utterance in progress".into()));
        }
        self.scorer.flush_features();
        let drive_result = self.drive();
        self.state = UttState::Idle;
        drive_result?;

        let sen_before = self.scorer.sen_evals();
        let search = self
            .searches
            .get_mut(&self.active)
            .expect("active search exists");
        let finish_result = search.finish(&mut self.scorer);
        self.scorer.end_utt()?;

        self.counters.utterances += 1;
        self.counters.frames += self.frame as u64;
        self.counters.senone_evals = self.scorer.sen_evals();
        let wall = self
            .utt_timer
            .take()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        self.counters.decode_time += wall;
        let audio = Duration::from_millis(10 * self.frame as u64);
        info!(
            utt = self.uttno,
            frames = self.frame,
            senone_evals = self.scorer.sen_evals() - sen_before,
            wall_ms = wall.as_millis() as u64,
            xrt = if audio.as_secs_f64() > 0.0 {
                wall.as_secs_f64() / audio.as_secs_f64()
            } else {
                0.0
            },
            "utterance finished"
        );

        match finish_result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "utterance failed");
                Err(self.poison_check(e))
            }
        }
    }

    pub fn hypothesis(&mut self) -> Option<Hypothesis> {
        self.searches.get_mut(&self.active)?.hypothesis()
    }

    /// Mid-utterance best guess without ending the utterance.
    pub fn partial_hypothesis(&mut self) -> Option<Hypothesis> {
        self.searches.get_mut(&self.active)?.partial_hypothesis()
    }

    /// Restartable iterator over the hypothesis segmentation.
    pub fn seg_iter(&mut self) -> SegIter {
        let segments = self
            .searches
            .get_mut(&self.active)
            .map(|s| s.segments())
            .unwrap_or_default();
        SegIter { segments, next: 0 }
    }

    pub fn lattice(&mut self) -> Option<Arc<Lattice>> {
        self.searches.get_mut(&self.active)?.lattice()
    }

    /// One-shot n-best iterator over the current lattice.
    pub fn nbest_iter(&mut self, min_ef_range: usize) -> Option<NBest> {
        let lattice = self.lattice()?;
        Some(NBest::new(lattice, self.lm.clone(), min_ef_range))
    }

    /// Log posterior probability of the reported hypothesis.
    pub fn probability(&mut self) -> Option<Score> {
        self.searches.get_mut(&self.active)?.posterior()
    }

    /// Whether an utterance is currently open. Endpointing proper lives
    /// upstream of the decoder.
    pub fn in_speech(&self) -> bool {
        self.state == UttState::Started
    }

    /// The filled alignment, when the active search is a state aligner that
    /// finished successfully.
    pub fn alignment(&self) -> Option<&Alignment> {
        self.searches.get(&self.active)?.alignment()
    }
}

pub struct SegIter {
    segments: Vec<Segment>,
    next: usize,
}

impl SegIter {
    pub fn restart(&mut self) {
        self.next = 0;
    }
}

impl Iterator for SegIter {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        let seg = self.segments.get(self.next).cloned();
        self.next += 1;
        seg
    }
}
