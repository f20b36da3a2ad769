//! Pronunciation dictionary. One pronunciation per line, `WORD PH1 PH2 ...`,
//! with alternative pronunciations carrying a parenthesised variant index
//! (`WORD(2)`). A second file with the same grammar supplies the filler words
//! (silence and noise events); fillers occupy a contiguous id range at the
//! end so a single comparison classifies a word id.
//!
//! Phones are resolved against the model definition as lines are read; a
//! line naming an unknown phone is reported and skipped rather than failing
//! the whole load.
use crate::error::{DecodeError, Result};
use crate::mdef::{CiPhoneId, ModelDef};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

pub type WordId = u32;
pub const NO_WORD: WordId = u32::MAX;

pub const START_WORD: &str = "<s>";
pub const FINISH_WORD: &str = "</s>";
pub const SILENCE_WORD: &str = "<sil>";

static VARIANT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+)\((\d+)\)$").unwrap());

#[derive(Debug, Clone)]
pub struct Word {
    /// Word text without any variant suffix.
    pub text: String,
    pub pronunciation: Vec<CiPhoneId>,
    /// Id of the base (first) variant; equal to the word's own id for it.
    pub base: WordId,
    pub filler: bool,
}

#[derive(Debug)]
pub struct Dictionary {
    mdef: Arc<ModelDef>,
    words: Vec<Word>,
    /// Base text -> base word id. Variant lookups go through `variant_index`.
    index: HashMap<String, WordId>,
    variant_index: HashMap<(String, u32), WordId>,
    filler_start: WordId,
    start_wid: WordId,
    finish_wid: WordId,
    silence_wid: WordId,
}

impl Dictionary {
    /// Load the main dictionary and the filler dictionary from files.
    pub fn open(
        mdef: Arc<ModelDef>,
        dict_path: impl AsRef<Path>,
        filler_path: Option<&Path>,
    ) -> Result<Self> {
        let main = io::BufReader::new(fs::File::open(dict_path)?);
        match filler_path {
            Some(p) => {
                let filler = io::BufReader::new(fs::File::open(p)?);
                Self::from_readers(mdef, main, Some(filler))
            }
            None => Self::from_readers(mdef, main, None::<io::Empty>),
        }
    }

    /// Build from readers so tests can feed in-memory fixtures.
    pub fn from_readers(
        mdef: Arc<ModelDef>,
        main: impl BufRead,
        filler: Option<impl BufRead>,
    ) -> Result<Self> {
        let mut dict = Self {
            mdef,
            words: Vec::new(),
            index: HashMap::new(),
            variant_index: HashMap::new(),
            filler_start: 0,
            start_wid: NO_WORD,
            finish_wid: NO_WORD,
            silence_wid: NO_WORD,
        };
        dict.read_into(main, false)?;
        dict.filler_start = dict.words.len() as WordId;
        if let Some(filler) = filler {
            dict.read_into(filler, true)?;
        }
        dict.ensure_specials()?;
        info!(
            words = dict.filler_start,
            fillers = dict.words.len() as u32 - dict.filler_start,
            "dictionary loaded"
        );
        Ok(dict)
    }

    fn read_into(&mut self, reader: impl BufRead, filler: bool) -> Result<()> {
        'outer: for line in reader
            .lines()
            .filter_map(|x| x.ok())
            .filter(|x| !x.trim().is_empty() && !x.starts_with(";;"))
        {
            let mut tokens = line.split_whitespace();
            let head = match tokens.next() {
                Some(s) => s,
                None => continue,
            };
            let text = match VARIANT.captures(head) {
                Some(c) => c.get(1).unwrap().as_str().to_string(),
                None => head.to_string(),
            };
            let mut pronunciation = Vec::new();
            for phone in tokens {
                match self.mdef.ciphone_id(phone) {
                    Some(ci) => pronunciation.push(ci),
                    None => {
                        error!("unknown phone {phone} in pronunciation of {head}, skipping");
                        continue 'outer;
                    }
                }
            }
            if pronunciation.is_empty() {
                error!("no pronunciation for {head}, skipping");
                continue;
            }
            self.push_word(text, pronunciation, filler);
        }
        Ok(())
    }

    fn push_word(&mut self, text: String, pronunciation: Vec<CiPhoneId>, filler: bool) -> WordId {
        let wid = self.words.len() as WordId;
        let base = match self.index.get(&text) {
            Some(&b) => {
                let variant = self.words.iter().filter(|w| w.text == text).count() as u32 + 1;
                self.variant_index.insert((text.clone(), variant), wid);
                b
            }
            None => {
                self.index.insert(text.clone(), wid);
                wid
            }
        };
        self.words.push(Word {
            text,
            pronunciation,
            base,
            filler,
        });
        wid
    }

    /// The search and LM boundary rely on `<s>`, `</s>` and `<sil>` existing;
    /// synthesise any that the filler dictionary didn't provide.
    fn ensure_specials(&mut self) -> Result<()> {
        let sil_phone = self.mdef.silence_phone();
        for name in [SILENCE_WORD, START_WORD, FINISH_WORD] {
            if !self.index.contains_key(name) {
                self.push_word(name.to_string(), vec![sil_phone], true);
            }
        }
        self.start_wid = self.index[START_WORD];
        self.finish_wid = self.index[FINISH_WORD];
        self.silence_wid = self.index[SILENCE_WORD];
        if self.start_wid < self.filler_start || self.finish_wid < self.filler_start {
            return Err(DecodeError::Config(
                "<s> and </s> must come from the filler dictionary".into(),
            ));
        }
        Ok(())
    }

    pub fn mdef(&self) -> &Arc<ModelDef> {
        &self.mdef
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn word(&self, wid: WordId) -> &Word {
        &self.words[wid as usize]
    }

    pub fn text(&self, wid: WordId) -> &str {
        &self.words[wid as usize].text
    }

    pub fn base_wid(&self, wid: WordId) -> WordId {
        self.words[wid as usize].base
    }

    /// Look a word up by text; `WORD(2)` selects the second variant.
    pub fn word_id(&self, text: &str) -> Option<WordId> {
        if let Some(c) = VARIANT.captures(text) {
            let base = c.get(1).unwrap().as_str();
            let n: u32 = c.get(2).unwrap().as_str().parse().ok()?;
            return self.variant_index.get(&(base.to_string(), n)).copied();
        }
        self.index.get(text).copied()
    }

    pub fn pronunciation(&self, wid: WordId) -> &[CiPhoneId] {
        &self.words[wid as usize].pronunciation
    }

    pub fn pron_len(&self, wid: WordId) -> usize {
        self.words[wid as usize].pronunciation.len()
    }

    pub fn first_phone(&self, wid: WordId) -> CiPhoneId {
        self.words[wid as usize].pronunciation[0]
    }

    pub fn last_phone(&self, wid: WordId) -> CiPhoneId {
        *self.words[wid as usize].pronunciation.last().unwrap()
    }

    pub fn second_last_phone(&self, wid: WordId) -> CiPhoneId {
        let p = &self.words[wid as usize].pronunciation;
        p[p.len() - 2]
    }

    pub fn is_filler(&self, wid: WordId) -> bool {
        wid >= self.filler_start
    }

    pub fn start_wid(&self) -> WordId {
        self.start_wid
    }

    pub fn finish_wid(&self) -> WordId {
        self.finish_wid
    }

    pub fn silence_wid(&self) -> WordId {
        self.silence_wid
    }

    /// Filler words the search should propose on its own: everything in the
    /// filler range except the start and finish markers.
    pub fn search_fillers(&self) -> impl Iterator<Item = WordId> + '_ {
        (self.filler_start..self.words.len() as WordId)
            .filter(move |&w| w != self.start_wid && w != self.finish_wid)
    }

    /// All real (non-filler) word ids.
    pub fn real_words(&self) -> impl Iterator<Item = WordId> + '_ {
        0..self.filler_start
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::logmath::LogMath;
    use crate::mdef::ModelDefBuilder;

    pub(crate) fn toy_mdef() -> Arc<ModelDef> {
        let lmath = LogMath::new(1.0001).unwrap();
        let mut b = ModelDefBuilder::new(3);
        let t = b
            .add_tmat(vec![
                vec![0.6, 0.4, 0.0, 0.0],
                vec![0.0, 0.6, 0.4, 0.0],
                vec![0.0, 0.0, 0.6, 0.4],
            ])
            .unwrap();
        let mut sen = 0;
        for (name, filler) in [
            ("SIL", true),
            ("AH", false),
            ("B", false),
            ("F", false),
            ("AY", false),
            ("V", false),
        ] {
            b.add_ciphone(name, filler, vec![sen, sen + 1, sen + 2], t)
                .unwrap();
            sen += 3;
        }
        b.build(&lmath).unwrap()
    }

    #[test]
    fn parses_variants_and_fillers() {
        let mdef = toy_mdef();
        let main = io::Cursor::new("FIVE F AY V\nA AH\nA(2) AY\n");
        let filler = io::Cursor::new("<sil> SIL\n++NOISE++ SIL\n");
        let d = Dictionary::from_readers(mdef, main, Some(filler)).unwrap();

        let five = d.word_id("FIVE").unwrap();
        assert_eq!(d.pron_len(five), 3);
        let a = d.word_id("A").unwrap();
        let a2 = d.word_id("A(2)").unwrap();
        assert_ne!(a, a2);
        assert_eq!(d.base_wid(a2), a);
        assert_eq!(d.text(a2), "A");

        assert!(d.is_filler(d.word_id("++NOISE++").unwrap()));
        assert!(!d.is_filler(five));
        // <s> and </s> synthesised, within the filler range.
        assert!(d.is_filler(d.start_wid()));
        assert!(d.is_filler(d.finish_wid()));
        // But not proposed by the search.
        assert!(d.search_fillers().all(|w| w != d.start_wid()));
    }

    #[test]
    fn unknown_phone_skips_line() {
        let mdef = toy_mdef();
        let main = io::Cursor::new("GOOD AH B\nBAD ZZ\n");
        let d = Dictionary::from_readers(mdef, main, None::<io::Empty>).unwrap();
        assert!(d.word_id("GOOD").is_some());
        assert!(d.word_id("BAD").is_none());
    }
}
