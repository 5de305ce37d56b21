use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use rayon::prelude::*;
use rc_io::ExpectedOutputFile;
use rc_match::{MatchResult, Matcher, Mismatch};
use rc_runtime::{Execution, Executor, Runtime};
use rc_types::{
    CaseDescriptor, ExecutionFault, Expectation, Output, RunResult, TranscriptMarkers,
};

use crate::classify::classify_run;

/// Run-level cancellation flag, shared by clones.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Reference outputs keyed by program content hash. Each key is written at
/// most once; a later writer gets the stored value back and its own result
/// is discarded.
#[derive(Debug, Default)]
pub struct ReferenceCache {
    entries: RwLock<HashMap<String, Output>>,
}

impl ReferenceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Output> {
        self.entries.read().get(key).cloned()
    }

    pub fn insert_first(&self, key: String, output: Output) -> Output {
        self.entries.write().entry(key).or_insert(output).clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ConformanceRunner {
    candidate: Arc<dyn Runtime>,
    reference: Option<Arc<dyn Runtime>>,
    stored: Option<ExpectedOutputFile>,
    executor: Executor,
    matcher: Matcher,
    workers: usize,
    cache: ReferenceCache,
}

impl ConformanceRunner {
    #[must_use]
    pub fn new(candidate: Arc<dyn Runtime>, executor: Executor) -> Self {
        Self {
            candidate,
            reference: None,
            stored: None,
            executor,
            matcher: Matcher::default(),
            workers: 1,
            cache: ReferenceCache::new(),
        }
    }

    #[must_use]
    pub fn with_reference(mut self, reference: Arc<dyn Runtime>) -> Self {
        self.reference = Some(reference);
        self
    }

    /// Resolves reference outputs from `stored` first, falling back to the
    /// live reference runtime (when one is set) for programs not in the file.
    #[must_use]
    pub fn with_stored_expectations(mut self, stored: ExpectedOutputFile) -> Self {
        self.stored = Some(stored);
        self
    }

    #[must_use]
    pub fn with_markers(mut self, markers: TranscriptMarkers) -> Self {
        self.matcher = Matcher::new(markers);
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn candidate(&self) -> &Arc<dyn Runtime> {
        &self.candidate
    }

    #[must_use]
    pub fn reference(&self) -> Option<&Arc<dyn Runtime>> {
        self.reference.as_ref()
    }

    #[must_use]
    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn cache(&self) -> &ReferenceCache {
        &self.cache
    }

    /// Runs every case not cancelled before it started. Results are sorted by
    /// case id.
    #[must_use]
    pub fn run(&self, cases: &[CaseDescriptor], cancel: &CancelToken) -> Vec<RunResult> {
        let mut results = parallel_map(self.workers, cases, |case| {
            if cancel.is_cancelled() {
                tracing::debug!(case_id = %case.id, "skipping case after cancellation");
                None
            } else {
                Some(self.run_case(case))
            }
        });
        results.sort_by(|a, b| a.case.id.cmp(&b.case.id));
        results
    }

    #[must_use]
    pub fn run_case(&self, case: &CaseDescriptor) -> RunResult {
        let started = Instant::now();
        let execution = self.execute_candidate(case);

        let mut fault = execution.fault;
        let mut reference = None;
        if fault.is_none() && case.expectation.needs_reference() {
            match self.resolve_reference(case) {
                Ok(output) => reference = Some(output),
                Err(reference_fault) => fault = Some(reference_fault),
            }
        }

        let mut matched = match &fault {
            Some(fault) => MatchResult::Mismatch(Mismatch {
                expected: self
                    .matcher
                    .expected_summary(&case.expectation, reference.as_ref()),
                actual: execution.output.render_transcript(self.matcher.markers()),
                reason: fault.to_string(),
            }),
            None => self.matcher.match_case(
                &execution.output,
                &case.expectation,
                reference.as_ref(),
                case.policy,
            ),
        };
        if fault.is_none()
            && matched.is_match()
            && let Expectation::OneOf { alternatives } = &case.expectation
            && let Some(reference_output) = self.alternatives_reference(case)
            && let MatchResult::Mismatch(mut mismatch) =
                self.matcher
                    .match_one_of(&reference_output, alternatives, case.policy)
        {
            mismatch.reason = format!(
                "reference output is not among the alternatives: {}",
                mismatch.reason
            );
            matched = MatchResult::Mismatch(mismatch);
        }
        let outcome = classify_run(&case.disposition, &matched, fault.as_ref());
        tracing::debug!(case_id = %case.id, %outcome, "case classified");

        RunResult {
            case: case.clone(),
            expected_summary: self
                .matcher
                .expected_summary(&case.expectation, reference.as_ref()),
            actual: execution.output,
            outcome,
            fault,
            mismatch: matched.mismatch().map(|mismatch| mismatch.reason.clone()),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub fn execute_candidate(&self, case: &CaseDescriptor) -> Execution {
        self.executor.execute(case, &self.candidate)
    }

    /// Stored expectation for the case program, else the live reference.
    pub fn resolve_reference(&self, case: &CaseDescriptor) -> Result<Output, ExecutionFault> {
        if let Some(stored) = &self.stored {
            let program = case.program_text();
            let entry = stored
                .lookup(&case.group, &program)
                .or_else(|| stored.find_input(&program));
            if let Some(entry) = entry {
                return Ok(Output::from_transcript(&entry.output, self.matcher.markers()));
            }
            if self.reference.is_none() {
                return Err(ExecutionFault::Unavailable {
                    diagnostic: format!("no stored expected output for case {}", case.id),
                });
            }
            tracing::debug!(case_id = %case.id, "stored expectation missing, running reference");
        }
        self.live_reference(case)
    }

    /// Reference output for checking `OneOf` alternatives. Absent when no
    /// reference source is configured or the reference faulted.
    fn alternatives_reference(&self, case: &CaseDescriptor) -> Option<Output> {
        if self.stored.is_none() && self.reference.is_none() {
            return None;
        }
        match self.resolve_reference(case) {
            Ok(output) => Some(output),
            Err(fault) => {
                tracing::debug!(case_id = %case.id, %fault, "alternatives left unchecked");
                None
            }
        }
    }

    /// Reference output from the live runtime, memoized per program.
    /// Faulted reference runs are returned but never cached.
    pub fn live_reference(&self, case: &CaseDescriptor) -> Result<Output, ExecutionFault> {
        let Some(runtime) = &self.reference else {
            return Err(ExecutionFault::Unavailable {
                diagnostic: "no reference runtime configured".to_owned(),
            });
        };
        let key = case.program_key();
        if let Some(output) = self.cache.get(&key) {
            tracing::trace!(case_id = %case.id, "reference cache hit");
            return Ok(output);
        }
        let execution = self.executor.execute(case, runtime);
        match execution.fault {
            Some(fault) => Err(fault),
            None => Ok(self.cache.insert_first(key, execution.output)),
        }
    }
}

/// Maps `items` on a scoped pool of `workers` threads, dropping `None`s.
/// Falls back to the calling thread when the pool cannot be built.
pub(crate) fn parallel_map<T, R, F>(workers: usize, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Option<R> + Sync,
{
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|idx| format!("rc-worker-{idx}"))
        .build_scoped(rayon::ThreadBuilder::run, |pool| {
            pool.install(|| items.par_iter().filter_map(&f).collect::<Vec<_>>())
        })
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to build worker pool, running sequentially");
            items.iter().filter_map(&f).collect()
        })
}
