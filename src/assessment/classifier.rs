//! # Evaluation-Mode Classifier
//!
//! Decides from the reference text alone how the engine should score a recording:
//! one word, a sentence, a paragraph, free talk, or one of the branch-based modes.
//!
//! ## Algorithm:
//! 1. Detect the language: any Han character means Chinese, otherwise any Latin letter
//!    means English, otherwise there is no mode.
//! 2. Count segments: whitespace-separated words for English, letters for Chinese
//!    (punctuation and whitespace are not counted).
//! 3. Walk [`RULES`] in order and return the first rule that matches. The table order is
//!    the priority, so the result never depends on iteration order of a map.
//!
//! `None` means "no rule matched"; callers treat it as the default single-utterance mode.

/// Characters that separate alternative answers in branch modes.
const BRANCH_DELIMITERS: [char; 3] = ['/', '\\', '|'];

/// Separator between words in realtime (word-by-word) mode.
const REALTIME_DELIMITER: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    Chinese,
}

/// How much speech one assessment covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Word,
    Sentence,
    Paragraph,
    FreeTalk,
    MultiBranch,
    RealTimeWord,
}

impl Granularity {
    /// The engine's `eval_mode` code.
    pub fn eval_mode(self) -> i64 {
        match self {
            Granularity::Word => 0,
            Granularity::Sentence => 1,
            Granularity::Paragraph => 2,
            Granularity::FreeTalk => 3,
            Granularity::MultiBranch => 6,
            Granularity::RealTimeWord => 7,
        }
    }

    /// Sentence-like modes override whatever mode the client asked for.
    pub fn overrides_request(self) -> bool {
        matches!(
            self,
            Granularity::Sentence | Granularity::Paragraph | Granularity::FreeTalk
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub language: Language,
    pub granularity: Granularity,
}

impl Mode {
    pub fn eval_mode(&self) -> i64 {
        self.granularity.eval_mode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Any,
    Required,
    Forbidden,
}

impl Presence {
    fn allows(self, present: bool) -> bool {
        match self {
            Presence::Any => true,
            Presence::Required => present,
            Presence::Forbidden => !present,
        }
    }
}

#[derive(Debug)]
struct ModeRule {
    language: Language,
    granularity: Granularity,
    /// Inclusive bounds on the segment count, 0 = unbounded
    min_segments: usize,
    max_segments: usize,
    whitespace: Presence,
    branch: Presence,
}

const fn rule(
    language: Language,
    granularity: Granularity,
    min_segments: usize,
    max_segments: usize,
    whitespace: Presence,
    branch: Presence,
) -> ModeRule {
    ModeRule {
        language,
        granularity,
        min_segments,
        max_segments,
        whitespace,
        branch,
    }
}

/// Rules in priority order. Branch modes come first because a branch delimiter changes
/// what the word count means; free talk comes last as the catch-all.
const RULES: &[ModeRule] = &[
    rule(Language::English, Granularity::RealTimeWord, 0, 0, Presence::Any, Presence::Required),
    rule(Language::English, Granularity::MultiBranch, 1, 120, Presence::Any, Presence::Required),
    rule(Language::English, Granularity::Word, 1, 1, Presence::Forbidden, Presence::Forbidden),
    rule(Language::English, Granularity::Sentence, 2, 30, Presence::Required, Presence::Forbidden),
    rule(Language::English, Granularity::Paragraph, 31, 120, Presence::Required, Presence::Forbidden),
    rule(Language::English, Granularity::FreeTalk, 0, 0, Presence::Any, Presence::Forbidden),
    rule(Language::Chinese, Granularity::RealTimeWord, 0, 0, Presence::Any, Presence::Required),
    rule(Language::Chinese, Granularity::MultiBranch, 1, 120, Presence::Any, Presence::Required),
    rule(Language::Chinese, Granularity::Word, 1, 4, Presence::Forbidden, Presence::Forbidden),
    rule(Language::Chinese, Granularity::Sentence, 5, 30, Presence::Any, Presence::Forbidden),
    rule(Language::Chinese, Granularity::Paragraph, 31, 120, Presence::Any, Presence::Forbidden),
    rule(Language::Chinese, Granularity::FreeTalk, 0, 0, Presence::Any, Presence::Forbidden),
];

fn is_han(c: char) -> bool {
    matches!(c,
        '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{20000}'..='\u{2FA1F}')
}

fn is_latin(c: char) -> bool {
    c.is_ascii_alphabetic() || (c.is_alphabetic() && ('\u{00C0}'..='\u{024F}').contains(&c))
}

pub fn detect_language(text: &str) -> Option<Language> {
    if text.chars().any(is_han) {
        Some(Language::Chinese)
    } else if text.chars().any(is_latin) {
        Some(Language::English)
    } else {
        None
    }
}

/// Words for English, letters for Chinese.
pub fn count_segments(text: &str, language: Language) -> usize {
    match language {
        Language::English => text.split_whitespace().count(),
        Language::Chinese => text.chars().filter(|c| c.is_alphanumeric()).count(),
    }
}

/// Realtime mode: at least two `/`-separated branches, each exactly one word (or letter).
fn is_realtime_structure(text: &str, language: Language) -> bool {
    let branches: Vec<&str> = text.split(REALTIME_DELIMITER).collect();
    if branches.len() < 2 {
        return false;
    }
    let segments: usize = branches.iter().map(|b| count_segments(b, language)).sum();
    segments == branches.len() && branches.iter().all(|b| count_segments(b, language) == 1)
}

fn within(count: usize, min: usize, max: usize) -> bool {
    (min == 0 || count >= min) && (max == 0 || count <= max)
}

/// Classify a reference text. Deterministic and free of side effects.
pub fn classify(reference_text: &str) -> Option<Mode> {
    let text = reference_text.trim();
    let language = detect_language(text)?;

    let has_whitespace = text.chars().any(char::is_whitespace);
    let has_branch = text.contains(BRANCH_DELIMITERS);
    let segments = count_segments(text, language);

    RULES
        .iter()
        .filter(|rule| rule.language == language)
        .find(|rule| {
            if !rule.branch.allows(has_branch) || !rule.whitespace.allows(has_whitespace) {
                return false;
            }
            match rule.granularity {
                Granularity::RealTimeWord => is_realtime_structure(text, language),
                _ => within(segments, rule.min_segments, rule.max_segments),
            }
        })
        .map(|rule| Mode {
            language,
            granularity: rule.granularity,
        })
}

/// The `eval_mode` actually sent to the engine.
///
/// Texts that are structurally a sentence, paragraph or free talk always use the
/// classified mode. Anything else keeps the client's requested mode, since single words
/// can legitimately be scored in several ways (plain word, word correction, ...).
pub fn effective_eval_mode(requested: i64, reference_text: &str) -> i64 {
    match classify(reference_text) {
        Some(mode) if mode.granularity.overrides_request() => mode.eval_mode(),
        _ => requested,
    }
}
