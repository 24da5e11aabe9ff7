//! Closed sets of job kinds.
//!
//! A job record stores its type as a plain string so that documents written by
//! any producer remain readable. Dispatch, however, goes through a [`JobKind`]:
//! a closed enum the handler implementation matches on exhaustively. A stored
//! type string that does not parse into the handler's kind is dead-lettered by
//! the recovery dispatcher instead of waiting forever.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::DEFAULT_TIMEOUT_MS;

/// A closed set of job types understood by one handler table.
pub trait JobKind: Copy + Send + Sync + fmt::Debug + 'static {
    /// Resolve a stored type tag. `None` means "no handler for this tag".
    fn parse(job_type: &str) -> Option<Self>;

    /// The tag written into job records.
    fn as_str(&self) -> &'static str;

    /// Advisory timeout recorded on jobs of this kind.
    fn default_timeout_ms(&self) -> u64 {
        DEFAULT_TIMEOUT_MS
    }
}

/// Job kinds produced by the bundled transcription and language-model services.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuiltinJobKind {
    WhisperTranscription,
    OllamaCompletion,
    OllamaChat,
}

impl BuiltinJobKind {
    pub const ALL: [BuiltinJobKind; 3] = [
        BuiltinJobKind::WhisperTranscription,
        BuiltinJobKind::OllamaCompletion,
        BuiltinJobKind::OllamaChat,
    ];
}

impl JobKind for BuiltinJobKind {
    fn parse(job_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == job_type)
    }

    fn as_str(&self) -> &'static str {
        match self {
            BuiltinJobKind::WhisperTranscription => "whisper-transcription",
            BuiltinJobKind::OllamaCompletion => "ollama-completion",
            BuiltinJobKind::OllamaChat => "ollama-chat",
        }
    }

    fn default_timeout_ms(&self) -> u64 {
        match self {
            // 15 minutes for audio, 20 for LLM calls.
            BuiltinJobKind::WhisperTranscription => 900_000,
            BuiltinJobKind::OllamaCompletion | BuiltinJobKind::OllamaChat => 1_200_000,
        }
    }
}

impl fmt::Display for BuiltinJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuiltinJobKind {
    type Err = crate::JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as JobKind>::parse(s)
            .ok_or_else(|| crate::JobError::validation(format!("unknown job type `{s}`")))
    }
}
