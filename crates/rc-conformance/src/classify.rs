use rc_match::MatchResult;
use rc_types::{Disposition, DispositionStatus, ExecutionFault, Outcome};

/// Total over the disposition × match space.
#[must_use]
pub fn classify(status: DispositionStatus, matched: bool) -> Outcome {
    match (status, matched) {
        (DispositionStatus::Normal, true) => Outcome::Pass,
        (DispositionStatus::Normal, false) => Outcome::UnexpectedFail,
        (DispositionStatus::Ignored, false) => Outcome::ExpectedFail,
        (DispositionStatus::Ignored, true) => Outcome::UnexpectedPass,
    }
}

/// A crash or timeout is never an expected failure, whatever the disposition.
#[must_use]
pub fn classify_run(
    disposition: &Disposition,
    result: &MatchResult,
    fault: Option<&ExecutionFault>,
) -> Outcome {
    if fault.is_some() {
        return Outcome::UnexpectedFail;
    }
    classify(disposition.status, result.is_match())
}
