#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix carried by every harness-synthesized error message.
pub const FATAL_PREFIX: &str = "fatal: ";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArgBinding {
    #[serde(default)]
    pub name: Option<String>,
    pub literal: String,
}

impl ArgBinding {
    #[must_use]
    pub fn positional(literal: impl Into<String>) -> Self {
        Self {
            name: None,
            literal: literal.into(),
        }
    }

    #[must_use]
    pub fn named(name: impl Into<String>, literal: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            literal: literal.into(),
        }
    }
}

/// Source text in the language under test plus the literal argument list
/// bound to `argv` ahead of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Snippet {
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<ArgBinding>,
}

impl Snippet {
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            bindings: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_bindings(source: impl Into<String>, bindings: Vec<ArgBinding>) -> Self {
        Self {
            source: source.into(),
            bindings,
        }
    }

    #[must_use]
    pub fn render(&self) -> String {
        if self.bindings.is_empty() {
            return self.source.clone();
        }
        let args = self
            .bindings
            .iter()
            .map(|binding| match &binding.name {
                Some(name) => format!("{name}={}", binding.literal),
                None => binding.literal.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("argv <- list({args});{}", self.source)
    }

    #[must_use]
    pub fn content_hash(&self) -> String {
        hash_hex(self.render().as_bytes())
    }
}

/// Console markers used to split a transcript into stdout, error and warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMarkers {
    pub error: String,
    pub warning: String,
}

impl Default for TranscriptMarkers {
    fn default() -> Self {
        Self {
            error: "Error".to_owned(),
            warning: "Warning message".to_owned(),
        }
    }
}

/// Captured result of evaluating one program.
///
/// An `error_message` means evaluation stopped early, so `completed` is
/// false whenever an error is present. Warnings may accompany a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Output {
    pub text: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub completed: bool,
}

impl Output {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            warnings: Vec::new(),
            error_message: None,
            completed: true,
        }
    }

    #[must_use]
    pub fn error(text: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            warnings: Vec::new(),
            error_message: Some(message.into()),
            completed: false,
        }
    }

    #[must_use]
    pub fn fatal(diagnostic: impl fmt::Display) -> Self {
        Self::error(String::new(), format!("{FATAL_PREFIX}{diagnostic}"))
    }

    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error_message.is_some()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.error_message
            .as_deref()
            .is_some_and(|message| message.starts_with(FATAL_PREFIX))
    }

    /// Appends the output of a later program in the same session.
    pub fn absorb(&mut self, next: Output) {
        self.text.push_str(&next.text);
        self.warnings.extend(next.warnings);
        if next.error_message.is_some() {
            self.error_message = next.error_message;
        }
        self.completed = self.completed && next.completed && self.error_message.is_none();
    }

    #[must_use]
    pub fn render_transcript(&self, markers: &TranscriptMarkers) -> String {
        let mut out = self.text.clone();
        if let Some(message) = &self.error_message {
            push_line_break(&mut out);
            if message.starts_with(&markers.error) {
                out.push_str(message);
            } else {
                out.push_str(&format!("{}: {message}", markers.error));
            }
        }
        match self.warnings.as_slice() {
            [] => {}
            [single] => {
                push_line_break(&mut out);
                out.push_str(&format!("{}:\n{single}", markers.warning));
            }
            many => {
                push_line_break(&mut out);
                out.push_str(&format!("{}s:", markers.warning));
                for (idx, warning) in many.iter().enumerate() {
                    out.push_str(&format!("\n{}: {warning}", idx + 1));
                }
            }
        }
        out
    }

    #[must_use]
    pub fn from_transcript(transcript: &str, markers: &TranscriptMarkers) -> Self {
        let mut text = String::new();
        let mut error_lines: Vec<&str> = Vec::new();
        let mut warning_lines: Vec<&str> = Vec::new();
        let mut section = TranscriptSection::Text;

        for line in transcript.split_inclusive('\n') {
            let bare = line.trim_end_matches('\n');
            if section != TranscriptSection::Warnings && bare.starts_with(&markers.warning) {
                section = TranscriptSection::Warnings;
                continue;
            }
            if section == TranscriptSection::Text && bare.starts_with(&markers.error) {
                section = TranscriptSection::Error;
            }
            match section {
                TranscriptSection::Text => text.push_str(line),
                TranscriptSection::Error => error_lines.push(bare),
                TranscriptSection::Warnings => warning_lines.push(bare),
            }
        }

        let error_message = if error_lines.is_empty() {
            None
        } else {
            Some(error_lines.join("\n"))
        };
        Self {
            text,
            warnings: split_warning_block(&warning_lines),
            completed: error_message.is_none(),
            error_message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TranscriptSection {
    Text,
    Error,
    Warnings,
}

fn push_line_break(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn split_warning_block(lines: &[&str]) -> Vec<String> {
    let numbered = lines.first().is_some_and(|line| numbered_prefix(line).is_some());
    if !numbered {
        return if lines.is_empty() {
            Vec::new()
        } else {
            vec![lines.join("\n")]
        };
    }

    let mut warnings: Vec<String> = Vec::new();
    for line in lines {
        match numbered_prefix(line) {
            Some(rest) => warnings.push(rest.to_owned()),
            None => {
                if let Some(last) = warnings.last_mut() {
                    last.push('\n');
                    last.push_str(line);
                }
            }
        }
    }
    warnings
}

fn numbered_prefix(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    line[digits..].strip_prefix(": ")
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    ExactText { text: String },
    ContainsError,
    ContainsWarning,
    #[default]
    ReferenceEquivalence,
    OneOf { alternatives: Vec<String> },
}

impl Expectation {
    #[must_use]
    pub fn needs_reference(&self) -> bool {
        matches!(self, Self::ReferenceEquivalence)
    }

    /// Reference outputs are compared against, or must appear among the
    /// listed alternatives.
    #[must_use]
    pub fn uses_reference(&self) -> bool {
        matches!(self, Self::ReferenceEquivalence | Self::OneOf { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhitespacePolicy {
    #[default]
    Strict,
    TrimTrailing,
    IgnoreWhitespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MatchPolicy {
    #[serde(default)]
    pub whitespace: WhitespacePolicy,
    #[serde(default)]
    pub ignore_error_context: bool,
    #[serde(default)]
    pub ignore_warning_context: bool,
}

impl MatchPolicy {
    #[must_use]
    pub fn strict() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ignore_whitespace() -> Self {
        Self {
            whitespace: WhitespacePolicy::IgnoreWhitespace,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_whitespace(mut self, whitespace: WhitespacePolicy) -> Self {
        self.whitespace = whitespace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionStatus {
    #[default]
    Normal,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreCategory {
    Unknown,
    Unimplemented,
    ImplementationError,
    ReferenceError,
    OutputFormatting,
}

impl IgnoreCategory {
    pub const ALL: [IgnoreCategory; 5] = [
        Self::Unknown,
        Self::Unimplemented,
        Self::ImplementationError,
        Self::ReferenceError,
        Self::OutputFormatting,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Unimplemented => "unimplemented",
            Self::ImplementationError => "implementation_error",
            Self::ReferenceError => "reference_error",
            Self::OutputFormatting => "output_formatting",
        }
    }
}

impl fmt::Display for IgnoreCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Disposition {
    #[serde(default)]
    pub status: DispositionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<IgnoreCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Disposition {
    #[must_use]
    pub fn normal() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ignored(category: IgnoreCategory) -> Self {
        Self {
            status: DispositionStatus::Ignored,
            category: Some(category),
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(self.status, DispositionStatus::Ignored)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDescriptor {
    pub id: String,
    #[serde(default)]
    pub group: String,
    pub snippets: Vec<Snippet>,
    #[serde(default)]
    pub expectation: Expectation,
    #[serde(default)]
    pub disposition: Disposition,
    #[serde(default)]
    pub policy: MatchPolicy,
}

impl CaseDescriptor {
    #[must_use]
    pub fn new(id: impl Into<String>, snippet: Snippet, expectation: Expectation) -> Self {
        Self {
            id: id.into(),
            group: String::new(),
            snippets: vec![snippet],
            expectation,
            disposition: Disposition::normal(),
            policy: MatchPolicy::strict(),
        }
    }

    /// Case compared against the reference runtime, the common authoring form.
    #[must_use]
    pub fn reference(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(id, Snippet::new(source), Expectation::ReferenceEquivalence)
    }

    #[must_use]
    pub fn exact(
        id: impl Into<String>,
        source: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            Snippet::new(source),
            Expectation::ExactText {
                text: expected.into(),
            },
        )
    }

    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[must_use]
    pub fn with_snippet(mut self, snippet: Snippet) -> Self {
        self.snippets.push(snippet);
        self
    }

    #[must_use]
    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Program text as submitted to a runtime, one rendered snippet per line.
    #[must_use]
    pub fn program_text(&self) -> String {
        self.snippets
            .iter()
            .map(Snippet::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Content hash of every rendered snippet in order.
    #[must_use]
    pub fn program_key(&self) -> String {
        let mut hasher = Sha256::new();
        for snippet in &self.snippets {
            let rendered = snippet.render();
            hasher.update((rendered.len() as u64).to_le_bytes());
            hasher.update(rendered.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn validate(&self) -> Result<(), CaseError> {
        if self.id.trim().is_empty() {
            return Err(CaseError::EmptyId);
        }
        if self.id.chars().any(char::is_control) {
            return Err(CaseError::ControlCharacterInId {
                id: self.id.escape_debug().to_string(),
            });
        }
        if self.snippets.is_empty() {
            return Err(CaseError::NoSnippets {
                id: self.id.clone(),
            });
        }
        if matches!(self.disposition.status, DispositionStatus::Normal)
            && self.disposition.category.is_some()
        {
            return Err(CaseError::CategoryWithoutIgnore {
                id: self.id.clone(),
            });
        }
        if let Expectation::OneOf { alternatives } = &self.expectation
            && alternatives.is_empty()
        {
            return Err(CaseError::NoAlternatives {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaseError {
    #[error("case id must not be empty")]
    EmptyId,
    #[error("case id {id} contains a control character")]
    ControlCharacterInId { id: String },
    #[error("case {id} has no snippets")]
    NoSnippets { id: String },
    #[error("case {id} carries an ignore category but is not ignored")]
    CategoryWithoutIgnore { id: String },
    #[error("case {id} expects one of zero alternatives")]
    NoAlternatives { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    ExpectedFail,
    UnexpectedFail,
    UnexpectedPass,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [
        Self::Pass,
        Self::ExpectedFail,
        Self::UnexpectedFail,
        Self::UnexpectedPass,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::ExpectedFail => "expected_fail",
            Self::UnexpectedFail => "unexpected_fail",
            Self::UnexpectedPass => "unexpected_pass",
        }
    }

    #[must_use]
    pub fn needs_review(self) -> bool {
        matches!(self, Self::UnexpectedFail | Self::UnexpectedPass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFault {
    Crash { diagnostic: String },
    Timeout { timeout_ms: u64 },
    Unavailable { diagnostic: String },
}

impl ExecutionFault {
    #[must_use]
    pub fn to_output(&self) -> Output {
        Output::fatal(self)
    }
}

impl fmt::Display for ExecutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crash { diagnostic } => write!(f, "crash: {diagnostic}"),
            Self::Timeout { timeout_ms } => write!(f, "timeout after {timeout_ms} ms"),
            Self::Unavailable { diagnostic } => write!(f, "runtime unavailable: {diagnostic}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub case: CaseDescriptor,
    pub actual: Output,
    pub expected_summary: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub fault: Option<ExecutionFault>,
    #[serde(default)]
    pub mismatch: Option<String>,
    pub duration_ms: u64,
}

#[must_use]
pub fn hash_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::{
        ArgBinding, CaseDescriptor, CaseError, Disposition, Expectation, IgnoreCategory, Output,
        Snippet, TranscriptMarkers,
    };

    #[test]
    fn snippet_renders_argv_bindings_ahead_of_source() {
        let snippet = Snippet::with_bindings(
            "do.call('c', argv)",
            vec![ArgBinding::named("a", "1L"), ArgBinding::positional("\"x\"")],
        );
        assert_eq!(
            snippet.render(),
            "argv <- list(a=1L, \"x\");do.call('c', argv)"
        );
        assert_eq!(Snippet::new("1+1").render(), "1+1");
    }

    #[test]
    fn program_key_depends_on_snippet_boundaries() {
        let joined = CaseDescriptor::reference("a", "x <- 1; x");
        let split = CaseDescriptor::reference("b", "x <- 1;").with_snippet(Snippet::new(" x"));
        assert_ne!(joined.program_key(), split.program_key());
        assert_eq!(
            joined.program_key(),
            CaseDescriptor::reference("c", "x <- 1; x").program_key()
        );
    }

    #[test]
    fn error_output_is_never_completed() {
        let out = Output::error("[1] 1\n", "Error in f() : boom");
        assert!(!out.completed);
        assert!(out.has_error());
        let fatal = Output::fatal("segfault");
        assert!(fatal.is_fatal());
        assert_eq!(fatal.error_message.as_deref(), Some("fatal: segfault"));
    }

    #[test]
    fn absorb_keeps_first_error_terminal() {
        let mut first = Output::text("[1] 1\n").with_warning("w1");
        first.absorb(Output::error("", "Error: stop"));
        assert_eq!(first.text, "[1] 1\n");
        assert_eq!(first.warnings, vec!["w1".to_owned()]);
        assert!(!first.completed);
    }

    #[test]
    fn transcript_round_trips_error_and_numbered_warnings() {
        let markers = TranscriptMarkers::default();
        let out = Output::error("[1] 2\n", "Error in g(x) : bad")
            .with_warning("In f(1) : first")
            .with_warning("second");
        let transcript = out.render_transcript(&markers);
        assert_eq!(
            transcript,
            "[1] 2\nError in g(x) : bad\nWarning messages:\n1: In f(1) : first\n2: second"
        );
        assert_eq!(Output::from_transcript(&transcript, &markers), out);
    }

    #[test]
    fn transcript_parses_single_warning_block() {
        let markers = TranscriptMarkers::default();
        let parsed = Output::from_transcript(
            "[1] NA\nWarning message:\nNAs introduced by coercion \n",
            &markers,
        );
        assert_eq!(parsed.text, "[1] NA\n");
        assert_eq!(parsed.warnings, vec!["NAs introduced by coercion ".to_owned()]);
        assert!(parsed.completed);
    }

    #[test]
    fn validation_rejects_category_on_normal_case() {
        let mut case = CaseDescriptor::reference("x", "1");
        case.disposition.category = Some(IgnoreCategory::Unknown);
        assert_eq!(
            case.validate(),
            Err(CaseError::CategoryWithoutIgnore { id: "x".to_owned() })
        );
        let ok = CaseDescriptor::reference("y", "1")
            .with_disposition(Disposition::ignored(IgnoreCategory::Unknown));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn validation_rejects_control_characters_in_ids() {
        let case: CaseDescriptor =
            serde_json::from_str(r#"{"id":"a\u0000b","snippets":[{"source":"1"}]}"#)
                .expect("case json");
        assert_eq!(
            case.validate(),
            Err(CaseError::ControlCharacterInId {
                id: "a\\0b".to_owned()
            })
        );
        assert!(CaseDescriptor::reference("a\tb", "1").validate().is_err());
        assert!(CaseDescriptor::reference("builtins.c/x y", "1").validate().is_ok());
    }

    #[test]
    fn expectation_defaults_to_reference_when_omitted() {
        let case: CaseDescriptor =
            serde_json::from_str(r#"{"id":"c1","snippets":[{"source":"c(1)"}]}"#)
                .expect("case json");
        assert_eq!(case.expectation, Expectation::ReferenceEquivalence);
        assert!(!case.disposition.is_ignored());
    }
}
