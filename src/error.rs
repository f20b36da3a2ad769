//! Error types shared across the decoder. Recoverable conditions (an empty
//! utterance, a lattice blowing past its edge budget) leave the session usable
//! for the next utterance; [`DecodeError::InternalInvariant`] poisons the
//! session and every later call returns it again.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Incompatible or incomplete configuration: a dictionary referencing a
    /// phone the model definition doesn't have, a missing required parameter.
    #[error("configuration error: {0}")]
    Config(String),
    /// Loaded components disagree on feature dimension, senone count or
    /// cepstral layout.
    #[error("model mismatch: {0}")]
    ModelMismatch(String),
    /// A frame was requested after the score cache already released it.
    #[error("frame {frame} has been evicted from the score cache")]
    OutOfBounds { frame: i32 },
    /// A frame was requested before enough audio arrived to produce it.
    #[error("frame {frame} has not been produced yet")]
    OutOfData { frame: i32 },
    /// `end_utt` with no frames processed or no word ever exiting the search.
    #[error("empty utterance: no word exits recorded")]
    EmptyUtterance,
    /// A lattice transformation would exceed the configured edge budget.
    #[error("lattice too large: {edges} edges exceeds limit of {max}")]
    LatticeTooLarge { edges: usize, max: usize },
    /// The state aligner could not reach the final state by the last frame.
    #[error("alignment impossible: utterance shorter than the model minimum")]
    AlignmentImpossible,
    /// Beam math or history bookkeeping went inconsistent. Fatal for the
    /// session.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Whether the session can keep going after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DecodeError::InternalInvariant(_))
    }
}
