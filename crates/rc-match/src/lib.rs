#![forbid(unsafe_code)]

use rc_types::{Expectation, MatchPolicy, Output, TranscriptMarkers, WhitespacePolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub expected: String,
    pub actual: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResult {
    Matched,
    Mismatch(Mismatch),
}

impl MatchResult {
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched)
    }

    #[must_use]
    pub fn mismatch(&self) -> Option<&Mismatch> {
        match self {
            Self::Matched => None,
            Self::Mismatch(mismatch) => Some(mismatch),
        }
    }

    fn from_comparison(expected: String, actual: String) -> Self {
        if expected == actual {
            Self::Matched
        } else {
            let reason = first_difference(&expected, &actual);
            Self::Mismatch(Mismatch {
                expected,
                actual,
                reason,
            })
        }
    }
}

/// Comparison functions parameterized by the console markers of the
/// runtimes being compared. Every method is a pure function of its inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matcher {
    markers: TranscriptMarkers,
}

impl Matcher {
    #[must_use]
    pub fn new(markers: TranscriptMarkers) -> Self {
        Self { markers }
    }

    #[must_use]
    pub fn markers(&self) -> &TranscriptMarkers {
        &self.markers
    }

    #[must_use]
    pub fn match_exact(&self, actual: &Output, expected: &str, policy: MatchPolicy) -> MatchResult {
        let expected = if policy.ignore_error_context || policy.ignore_warning_context {
            self.comparable(&Output::from_transcript(expected, &self.markers), policy)
        } else {
            expected.to_owned()
        };
        MatchResult::from_comparison(
            normalize(&expected, policy.whitespace),
            normalize(&self.comparable(actual, policy), policy.whitespace),
        )
    }

    #[must_use]
    pub fn match_reference(
        &self,
        actual: &Output,
        reference: &Output,
        policy: MatchPolicy,
    ) -> MatchResult {
        MatchResult::from_comparison(
            normalize(&self.comparable(reference, policy), policy.whitespace),
            normalize(&self.comparable(actual, policy), policy.whitespace),
        )
    }

    #[must_use]
    pub fn match_one_of(
        &self,
        actual: &Output,
        alternatives: &[String],
        policy: MatchPolicy,
    ) -> MatchResult {
        let mut last = None;
        for alternative in alternatives {
            match self.match_exact(actual, alternative, policy) {
                MatchResult::Matched => return MatchResult::Matched,
                MatchResult::Mismatch(mismatch) => last = Some(mismatch),
            }
        }
        MatchResult::Mismatch(Mismatch {
            expected: alternatives.join("\n--- or ---\n"),
            actual: self.comparable(actual, policy),
            reason: match last {
                Some(mismatch) => format!(
                    "none of {} alternatives matched; last: {}",
                    alternatives.len(),
                    mismatch.reason
                ),
                None => "no alternatives to match against".to_owned(),
            },
        })
    }

    #[must_use]
    pub fn match_case(
        &self,
        actual: &Output,
        expectation: &Expectation,
        reference: Option<&Output>,
        policy: MatchPolicy,
    ) -> MatchResult {
        match expectation {
            Expectation::ExactText { text } => self.match_exact(actual, text, policy),
            Expectation::ContainsError => match_contains_error(actual),
            Expectation::ContainsWarning => match_contains_warning(actual),
            Expectation::ReferenceEquivalence => match reference {
                Some(reference) => self.match_reference(actual, reference, policy),
                None => MatchResult::Mismatch(Mismatch {
                    expected: "<reference output unavailable>".to_owned(),
                    actual: self.comparable(actual, policy),
                    reason: "no reference output was resolved for this case".to_owned(),
                }),
            },
            Expectation::OneOf { alternatives } => {
                self.match_one_of(actual, alternatives, policy)
            }
        }
    }

    #[must_use]
    pub fn expected_summary(&self, expectation: &Expectation, reference: Option<&Output>) -> String {
        match expectation {
            Expectation::ExactText { text } => text.clone(),
            Expectation::ContainsError => "<any error>".to_owned(),
            Expectation::ContainsWarning => "<any warning>".to_owned(),
            Expectation::ReferenceEquivalence => reference.map_or_else(
                || "<reference output unavailable>".to_owned(),
                |output| output.render_transcript(&self.markers),
            ),
            Expectation::OneOf { alternatives } => alternatives.join("\n--- or ---\n"),
        }
    }

    fn comparable(&self, output: &Output, policy: MatchPolicy) -> String {
        if !policy.ignore_error_context && !policy.ignore_warning_context {
            return output.render_transcript(&self.markers);
        }
        let mut stripped = output.clone();
        if policy.ignore_error_context {
            stripped.error_message = stripped
                .error_message
                .as_deref()
                .map(|message| strip_context(message).to_owned());
        }
        if policy.ignore_warning_context {
            stripped.warnings = stripped
                .warnings
                .iter()
                .map(|warning| strip_context(warning).to_owned())
                .collect();
        }
        stripped.render_transcript(&self.markers)
    }
}

#[must_use]
pub fn match_contains_error(actual: &Output) -> MatchResult {
    if actual.has_error() {
        MatchResult::Matched
    } else {
        MatchResult::Mismatch(Mismatch {
            expected: "<any error>".to_owned(),
            actual: actual.render_transcript(&TranscriptMarkers::default()),
            reason: "evaluation produced no error".to_owned(),
        })
    }
}

#[must_use]
pub fn match_contains_warning(actual: &Output) -> MatchResult {
    if actual.has_warnings() {
        MatchResult::Matched
    } else {
        MatchResult::Mismatch(Mismatch {
            expected: "<any warning>".to_owned(),
            actual: actual.render_transcript(&TranscriptMarkers::default()),
            reason: "evaluation produced no warning".to_owned(),
        })
    }
}

#[must_use]
pub fn match_exact(actual: &Output, expected: &str, policy: MatchPolicy) -> MatchResult {
    Matcher::default().match_exact(actual, expected, policy)
}

#[must_use]
pub fn match_reference(actual: &Output, reference: &Output, policy: MatchPolicy) -> MatchResult {
    Matcher::default().match_reference(actual, reference, policy)
}

#[must_use]
pub fn normalize(text: &str, policy: WhitespacePolicy) -> String {
    match policy {
        WhitespacePolicy::Strict => text.to_owned(),
        WhitespacePolicy::TrimTrailing => trim_trailing_spaces(text),
        WhitespacePolicy::IgnoreWhitespace => {
            text.chars().filter(|ch| !ch.is_whitespace()).collect()
        }
    }
}

/// Strips spaces at the end of every line, keeping line breaks.
#[must_use]
pub fn trim_trailing_spaces(text: &str) -> String {
    text.split_inclusive('\n')
        .map(|line| match line.strip_suffix('\n') {
            Some(body) => format!("{}\n", body.trim_end_matches(' ')),
            None => line.trim_end_matches(' ').to_owned(),
        })
        .collect()
}

/// The message part after the last `:`, without the call context before it.
#[must_use]
pub fn strip_context(message: &str) -> &str {
    match message.rfind(':') {
        Some(idx) => message[idx + 1..].trim_start(),
        None => message,
    }
}

fn first_difference(expected: &str, actual: &str) -> String {
    let mut expected_lines = expected.lines();
    let mut actual_lines = actual.lines();
    let mut line_no = 1usize;
    loop {
        match (expected_lines.next(), actual_lines.next()) {
            (Some(left), Some(right)) if left == right => line_no += 1,
            (Some(left), Some(right)) => {
                return format!("line {line_no} differs: expected={left:?}, actual={right:?}");
            }
            (Some(left), None) => {
                return format!("line {line_no} missing from actual: expected={left:?}");
            }
            (None, Some(right)) => {
                return format!("unexpected extra line {line_no}: actual={right:?}");
            }
            (None, None) => {
                return format!(
                    "line structure equal but bytes differ: expected_len={}, actual_len={}",
                    expected.len(),
                    actual.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rc_types::{Expectation, MatchPolicy, Output, TranscriptMarkers, WhitespacePolicy};

    use super::{
        MatchResult, Matcher, match_contains_error, match_contains_warning, match_exact,
        match_reference, normalize, strip_context, trim_trailing_spaces,
    };

    #[test]
    fn exact_text_passes_on_identical_output() {
        let actual = Output::text("42");
        assert_eq!(
            match_exact(&actual, "42", MatchPolicy::strict()),
            MatchResult::Matched
        );
        let mismatch = match_exact(&actual, "43", MatchPolicy::strict());
        let detail = mismatch.mismatch().expect("mismatch");
        assert!(detail.reason.contains("line 1 differs"), "{detail:?}");
    }

    #[test]
    fn trailing_newline_only_matters_under_strict() {
        let actual = Output::text("[1] 1 2 3\n");
        assert!(!match_exact(&actual, "[1] 1 2 3", MatchPolicy::strict()).is_match());
        assert!(match_exact(&actual, "[1] 1 2 3", MatchPolicy::ignore_whitespace()).is_match());
    }

    #[test]
    fn trim_trailing_keeps_line_breaks() {
        assert_eq!(trim_trailing_spaces("a  \nb \n c"), "a\nb\n c");
        let policy = MatchPolicy::strict().with_whitespace(WhitespacePolicy::TrimTrailing);
        assert!(match_exact(&Output::text("[1] 1   \n"), "[1] 1\n", policy).is_match());
        assert!(!match_exact(&Output::text("[1] 1\n"), "[1] 1", policy).is_match());
    }

    #[test]
    fn contains_checks_ignore_message_text() {
        let out = Output::error("", "Error in f() : anything").with_warning("whatever");
        assert!(match_contains_error(&out).is_match());
        assert!(match_contains_warning(&out).is_match());
        assert!(!match_contains_error(&Output::text("ok")).is_match());
        assert!(!match_contains_warning(&Output::text("ok")).is_match());
    }

    #[test]
    fn reference_equivalence_compares_whole_transcripts() {
        let reference = Output::text("[1] 1\n").with_warning("In f() : careful");
        let same = reference.clone();
        let missing_warning = Output::text("[1] 1\n");
        assert!(match_reference(&same, &reference, MatchPolicy::strict()).is_match());
        assert!(!match_reference(&missing_warning, &reference, MatchPolicy::strict()).is_match());
    }

    #[test]
    fn error_context_can_be_ignored() {
        let reference = Output::error("", "Error in c(1, 2) : invalid argument");
        let actual = Output::error("", "Error in c(): invalid argument");
        assert!(!match_reference(&actual, &reference, MatchPolicy::strict()).is_match());
        let policy = MatchPolicy {
            ignore_error_context: true,
            ..MatchPolicy::strict()
        };
        assert!(match_reference(&actual, &reference, policy).is_match());
        assert!(match_exact(&actual, "Error in foo(x) : invalid argument", policy).is_match());
    }

    #[test]
    fn strip_context_drops_call_prefix() {
        assert_eq!(strip_context("Error in f(x) :   boom"), "boom");
        assert_eq!(strip_context("no context"), "no context");
    }

    #[test]
    fn one_of_accepts_any_alternative() {
        let matcher = Matcher::default();
        let expectation = Expectation::OneOf {
            alternatives: vec!["[1] \"b\"".to_owned(), "[1] \"a\"".to_owned()],
        };
        let result = matcher.match_case(
            &Output::text("[1] \"a\""),
            &expectation,
            None,
            MatchPolicy::strict(),
        );
        assert!(result.is_match());
        let miss = matcher.match_case(
            &Output::text("[1] \"c\""),
            &expectation,
            None,
            MatchPolicy::strict(),
        );
        assert!(miss.mismatch().expect("mismatch").reason.contains("none of 2"));
    }

    #[test]
    fn missing_reference_is_a_mismatch() {
        let result = Matcher::default().match_case(
            &Output::text("1"),
            &Expectation::ReferenceEquivalence,
            None,
            MatchPolicy::strict(),
        );
        assert!(!result.is_match());
    }

    #[test]
    fn custom_markers_render_both_sides_alike() {
        let matcher = Matcher::new(TranscriptMarkers {
            error: "Fehler".to_owned(),
            warning: "Warnmeldung".to_owned(),
        });
        let actual = Output::error("", "Fehler in f() : kaputt");
        assert!(
            matcher
                .match_exact(&actual, "Fehler in f() : kaputt", MatchPolicy::strict())
                .is_match()
        );
    }

    proptest! {
        #[test]
        fn matching_is_pure(text in ".{0,40}", expected in ".{0,40}", ws in 0u8..3) {
            let policy = MatchPolicy::strict().with_whitespace(match ws {
                0 => WhitespacePolicy::Strict,
                1 => WhitespacePolicy::TrimTrailing,
                _ => WhitespacePolicy::IgnoreWhitespace,
            });
            let actual = Output::text(text);
            let first = match_exact(&actual, &expected, policy);
            let second = match_exact(&actual, &expected, policy);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn ignore_whitespace_is_idempotent(text in "[ a-z\\n\\t]{0,40}") {
            let once = normalize(&text, WhitespacePolicy::IgnoreWhitespace);
            prop_assert_eq!(normalize(&once, WhitespacePolicy::IgnoreWhitespace), once);
        }
    }
}
