#![forbid(unsafe_code)]

//! Differential conformance testing for R-language runtimes.
//!
//! A candidate interpreter runs each case program; its console transcript is
//! compared with an expected text, an error or warning check, or the output
//! of a reference interpreter. Every case is then classified against its
//! disposition and folded into a run report.
//!
//! The member crates stay available for callers that want one layer only:
//! [`types`], [`generate`], [`matching`], [`runtime`], [`io`], [`conformance`].

pub use rc_conformance as conformance;
pub use rc_generate as generate;
pub use rc_io as io;
pub use rc_match as matching;
pub use rc_runtime as runtime;
pub use rc_types as types;

pub use rc_conformance::{
    CancelToken, ConformanceRunner, HarnessConfig, HarnessError, OracleMode, RunReport,
    SuiteOptions, exit_code, generate_diff, generate_expected, load_cases, render_summary,
    run_cases, run_suite,
};
pub use rc_generate::{gen_test, repeat, template_product, test_combine};
pub use rc_io::{ExpectedOutputFile, load_case_tables};
pub use rc_match::{MatchResult, Matcher};
pub use rc_runtime::{Executor, FnRuntime, ProcessRuntime, Runtime, RuntimeSpec, TableRuntime};
pub use rc_types::{
    CaseDescriptor, Disposition, Expectation, IgnoreCategory, MatchPolicy, Outcome, Output,
    RunResult,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{
        CancelToken, CaseDescriptor, ConformanceRunner, Executor, Outcome, Output, TableRuntime,
        run_cases, test_combine,
    };

    #[test]
    fn facade_runs_generated_cases_against_tables() {
        let cases = test_combine("builtins.c", &["1L"]).expect("combine");
        let sources: Vec<String> = cases
            .iter()
            .map(|case| case.snippets[0].source.clone())
            .collect();
        let candidate = TableRuntime::from_pairs(
            "candidate",
            sources.iter().map(|source| (source.clone(), Output::text("[1] 1\n"))),
        );
        let reference = TableRuntime::from_pairs(
            "reference",
            sources.iter().map(|source| (source.clone(), Output::text("[1] 1\n"))),
        );
        let runner =
            ConformanceRunner::new(Arc::new(candidate), Executor::new(Duration::from_secs(5)))
                .with_reference(Arc::new(reference))
                .with_workers(2);

        let mut all = cases;
        all.push(CaseDescriptor::exact("extra/unknown", "nope()", "[1] 1\n"));
        let report = run_cases(&runner, &all, &CancelToken::new());
        assert_eq!(report.count(Outcome::Pass), 12);
        assert_eq!(report.count(Outcome::UnexpectedFail), 1);
    }
}
