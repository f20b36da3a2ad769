//! Decoder configuration. Beams are linear probabilities here and get
//! converted into log-domain offsets against the session's log base at init;
//! this keeps the config file readable and independent of the base.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Base of the integer log domain.
    pub logbase: f64,
    /// Number of cepstral coefficients per input frame. The composed feature
    /// frame is three times this (cepstra, delta, double delta).
    pub n_cep: usize,
    /// Apply running cepstral mean normalisation to incoming cepstra.
    pub cmn: bool,

    /// Main HMM survival beam (linear).
    pub hmm_beam: f64,
    /// Cross-HMM (phone transition) beam, looser than `hmm_beam`.
    pub phone_beam: f64,
    /// Word exit beam against the best word-exit score of the frame.
    pub word_beam: f64,
    /// Extra beam applied to word entries per final CI phone; 0.0 disables.
    pub word_end_beam: f64,

    /// Histogram pruning limit on active HMMs per frame.
    pub max_hmm_per_frame: usize,
    /// At most this many distinct base words kept per frame of history.
    pub max_words_per_frame: usize,
    /// At most this many history entries kept per frame.
    pub max_hist_per_frame: usize,

    /// Number of interleaved lexical tree copies the forward search round
    /// robins word entries across.
    pub n_tree: usize,
    /// Word exits per tree copy before rotating to the next one.
    pub entries_per_tree: usize,

    /// Gaussians retained per codebook by the top-N shortlist.
    pub n_top: usize,
    /// Score-vector cache depth in frames.
    pub frame_cache: usize,

    /// Use the max unigram probability below each tree node as a look-ahead
    /// score; when off every node gets a neutral zero.
    pub lm_lookahead: bool,
    /// Language weight applied to LM scores.
    pub language_weight: f64,
    /// Linear probability of the silence filler word.
    pub silence_prob: f64,
    /// Linear probability of the remaining filler words.
    pub filler_prob: f64,

    /// Run the second (flat-lexicon) pass after the tree pass.
    pub flat_rescore: bool,
    /// Frames of slack around first-pass candidate end frames in the second
    /// pass.
    pub flat_window: i32,
    /// Build the lattice and compute link posteriors at `end_utt`.
    pub bestpath: bool,
    /// Edge budget for lattice transformations.
    pub max_lattice_edges: usize,

    /// Replay senone scores from this `.npy` file instead of computing them.
    pub senone_replay: Option<std::path::PathBuf>,
    /// Append computed senone scores to this `.npy` file at `end_utt`.
    pub senone_tee: Option<std::path::PathBuf>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            logbase: 1.0001,
            n_cep: 13,
            cmn: true,
            hmm_beam: 1e-48,
            phone_beam: 1e-40,
            word_beam: 7e-29,
            word_end_beam: 0.0,
            max_hmm_per_frame: 30_000,
            max_words_per_frame: 20,
            max_hist_per_frame: 100,
            n_tree: 3,
            entries_per_tree: 3,
            n_top: 4,
            frame_cache: 16,
            lm_lookahead: true,
            language_weight: 9.5,
            silence_prob: 0.1,
            filler_prob: 0.05,
            flat_rescore: false,
            flat_window: 1,
            bestpath: true,
            max_lattice_edges: 2_000_000,
            senone_replay: None,
            senone_tee: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let config = DecoderConfig {
            n_cep: 1,
            n_tree: 1,
            ..Default::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        let back: DecoderConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.n_cep, 1);
        assert_eq!(back.n_tree, 1);
        assert_eq!(back.logbase, config.logbase);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let back: DecoderConfig = serde_json::from_str(r#"{"n_cep": 4}"#).unwrap();
        assert_eq!(back.n_cep, 4);
        assert_eq!(back.n_top, DecoderConfig::default().n_top);
    }
}
