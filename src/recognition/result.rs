//! Scoring results as produced by the engine and forwarded to clients.
//!
//! The top-level result is sent to clients in snake_case. Per-word and per-phone details
//! keep the engine's PascalCase field names, so client code written against the engine's
//! documentation reads them unchanged.

use serde::{Deserialize, Serialize};

/// One intermediate or final assessment.
///
/// All numeric fields are `f64` and always serialized (zero included), so what the engine
/// reported reaches the client without loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub overall_score: f64,
    pub words: Vec<WordResult>,
    pub pron_accuracy: f64,
    pub pron_fluency: f64,
    pub pron_completion: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WordResult {
    /// Start of the word in the audio, milliseconds
    pub mem_begin_time: i64,
    /// End of the word in the audio, milliseconds
    pub mem_end_time: i64,
    pub pron_accuracy: f64,
    pub pron_fluency: f64,
    pub word: String,
    /// 0 matched, 1 inserted, 2 missing, 3 repeated/extra
    pub match_tag: i64,
    pub phone_infos: Vec<PhoneInfo>,
    pub reference_word: String,
    pub keyword_tag: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PhoneInfo {
    pub mem_begin_time: i64,
    pub mem_end_time: i64,
    pub pron_accuracy: f64,
    pub detected_stress: bool,
    pub phone: String,
    pub stress: bool,
    pub reference_phone: String,
    pub match_tag: i64,
    pub reference_letter: String,
}

/// The engine's own shape for a sentence result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct SentenceInfo {
    pub suggested_score: f64,
    pub pron_accuracy: f64,
    pub pron_fluency: f64,
    pub pron_completion: f64,
    pub words: Vec<WordResult>,
}

impl From<SentenceInfo> for AssessmentResult {
    fn from(info: SentenceInfo) -> Self {
        Self {
            overall_score: info.suggested_score,
            words: info.words,
            pron_accuracy: info.pron_accuracy,
            pron_fluency: info.pron_fluency,
            pron_completion: info.pron_completion,
        }
    }
}
