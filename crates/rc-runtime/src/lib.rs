#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use rc_types::{CaseDescriptor, ExecutionFault, Output};
use thiserror::Error;

pub mod process;
pub mod table;

pub use process::{OutputProtocol, ProcessRuntime, RuntimeSpec};
pub use table::TableRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime {runtime} is unavailable: {detail}")]
    Unavailable { runtime: String, detail: String },
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("process deadline of {timeout_ms} ms exceeded")]
    DeadlineExceeded { timeout_ms: u64 },
    #[error("process exited with status {status}: {stderr}")]
    ProcessFailed { status: i32, stderr: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no recorded output for snippet {0:?}")]
    UnknownSnippet(String),
    #[error("evaluation crashed: {0}")]
    Crashed(String),
}

impl RuntimeError {
    #[must_use]
    pub fn into_fault(self) -> ExecutionFault {
        match self {
            Self::Unavailable { .. } | Self::Spawn { .. } => ExecutionFault::Unavailable {
                diagnostic: self.to_string(),
            },
            Self::DeadlineExceeded { timeout_ms } => ExecutionFault::Timeout { timeout_ms },
            other => ExecutionFault::Crash {
                diagnostic: other.to_string(),
            },
        }
    }
}

/// One isolated evaluation context. State set by one snippet is visible to
/// the later snippets of the same session and to nothing else.
pub trait Session: Send {
    fn run_snippet(&mut self, source: &str) -> Result<Output, RuntimeError>;

    /// Runs rendered snippets in order, concatenating text and warnings and
    /// stopping after the first snippet that reports an error.
    fn run_program(&mut self, snippets: &[String]) -> Result<Output, RuntimeError> {
        let mut combined = Output::text("");
        for snippet in snippets {
            let next = self.run_snippet(snippet)?;
            let stop = next.has_error();
            combined.absorb(next);
            if stop {
                break;
            }
        }
        Ok(combined)
    }
}

pub trait Runtime: Send + Sync {
    fn name(&self) -> &str;

    fn open_session(&self) -> Result<Box<dyn Session>, RuntimeError>;
}

/// Stateless runtime backed by a closure, evaluated once per snippet.
pub struct FnRuntime<F> {
    name: String,
    eval: Arc<F>,
}

impl<F> FnRuntime<F>
where
    F: Fn(&str) -> Result<Output, RuntimeError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, eval: F) -> Self {
        Self {
            name: name.into(),
            eval: Arc::new(eval),
        }
    }
}

struct FnSession<F> {
    eval: Arc<F>,
}

impl<F> Session for FnSession<F>
where
    F: Fn(&str) -> Result<Output, RuntimeError> + Send + Sync + 'static,
{
    fn run_snippet(&mut self, source: &str) -> Result<Output, RuntimeError> {
        (self.eval)(source)
    }
}

impl<F> Runtime for FnRuntime<F>
where
    F: Fn(&str) -> Result<Output, RuntimeError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn open_session(&self) -> Result<Box<dyn Session>, RuntimeError> {
        Ok(Box::new(FnSession {
            eval: Arc::clone(&self.eval),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub output: Output,
    pub fault: Option<ExecutionFault>,
    pub duration: Duration,
}

impl Execution {
    fn faulted(fault: ExecutionFault, duration: Duration) -> Self {
        Self {
            output: fault.to_output(),
            fault: Some(fault),
            duration,
        }
    }
}

/// Runs each case in a fresh session on its own thread.
///
/// A case that outlives the timeout is abandoned: its thread keeps running
/// detached and its eventual result is dropped. Panics inside the runtime are
/// caught and reported as a crash, so `execute` itself never panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Executor {
    timeout: Duration,
}

impl Executor {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn execute(&self, case: &CaseDescriptor, runtime: &Arc<dyn Runtime>) -> Execution {
        let program: Vec<String> = case.snippets.iter().map(|snippet| snippet.render()).collect();
        let started = Instant::now();
        let (tx, rx) = mpsc::channel();
        let worker_runtime = Arc::clone(runtime);

        let spawned = thread::Builder::new()
            .name(thread_name(&case.id))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    let mut session = worker_runtime.open_session()?;
                    session.run_program(&program)
                }));
                let _ = tx.send(result);
            });
        if let Err(err) = spawned {
            let fault = ExecutionFault::Unavailable {
                diagnostic: format!("could not start case thread: {err}"),
            };
            return self.report_fault(case, runtime.name(), fault, started);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(Ok(output))) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    case_id = %case.id,
                    runtime = runtime.name(),
                    completed = output.completed,
                    "case executed"
                );
                Execution {
                    output,
                    fault: None,
                    duration: started.elapsed(),
                }
            }
            Ok(Ok(Err(err))) => self.report_fault(case, runtime.name(), err.into_fault(), started),
            Ok(Err(payload)) => {
                let fault = ExecutionFault::Crash {
                    diagnostic: format!("panic: {}", panic_message(payload.as_ref())),
                };
                self.report_fault(case, runtime.name(), fault, started)
            }
            Err(RecvTimeoutError::Timeout) => {
                let fault = ExecutionFault::Timeout {
                    timeout_ms: duration_ms(self.timeout),
                };
                self.report_fault(case, runtime.name(), fault, started)
            }
            Err(RecvTimeoutError::Disconnected) => {
                let fault = ExecutionFault::Crash {
                    diagnostic: "case thread exited without a result".to_owned(),
                };
                self.report_fault(case, runtime.name(), fault, started)
            }
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn report_fault(
        &self,
        case: &CaseDescriptor,
        runtime: &str,
        fault: ExecutionFault,
        started: Instant,
    ) -> Execution {
        #[cfg(feature = "tracing")]
        tracing::warn!(case_id = %case.id, runtime, %fault, "case execution faulted");
        Execution::faulted(fault, started.elapsed())
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Duration::from_millis(30_000))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

/// Thread names may not contain NUL; ids from unvalidated sources can.
fn thread_name(case_id: &str) -> String {
    let id: String = case_id.chars().filter(|ch| !ch.is_control()).collect();
    format!("rc-case-{id}")
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use rc_types::{CaseDescriptor, ExecutionFault, Output, Snippet};

    use super::{Executor, FnRuntime, Runtime, RuntimeError};

    fn echo_runtime() -> Arc<dyn Runtime> {
        Arc::new(FnRuntime::new("echo", |source: &str| {
            if let Some(message) = source.strip_prefix("stop ") {
                return Ok(Output::error("", format!("Error: {message}")));
            }
            if let Some(message) = source.strip_prefix("warn ") {
                return Ok(Output::text("").with_warning(message));
            }
            Ok(Output::text(format!("{source}\n")))
        }))
    }

    #[test]
    fn snippets_share_one_session_and_stop_at_first_error() {
        let case = CaseDescriptor::reference("multi", "a")
            .with_snippet(Snippet::new("warn careful"))
            .with_snippet(Snippet::new("stop boom"))
            .with_snippet(Snippet::new("never"));
        let execution = Executor::new(Duration::from_secs(5)).execute(&case, &echo_runtime());
        assert!(execution.fault.is_none());
        assert_eq!(execution.output.text, "a\n");
        assert_eq!(execution.output.warnings, vec!["careful".to_owned()]);
        assert_eq!(execution.output.error_message.as_deref(), Some("Error: boom"));
        assert!(!execution.output.completed);
    }

    #[test]
    fn slow_case_times_out_with_fatal_output() {
        let runtime: Arc<dyn Runtime> = Arc::new(FnRuntime::new("slow", |_: &str| {
            thread::sleep(Duration::from_millis(500));
            Ok(Output::text("late"))
        }));
        let case = CaseDescriptor::reference("slow", "1");
        let execution = Executor::new(Duration::from_millis(20)).execute(&case, &runtime);
        assert_eq!(execution.fault, Some(ExecutionFault::Timeout { timeout_ms: 20 }));
        assert_eq!(
            execution.output.error_message.as_deref(),
            Some("fatal: timeout after 20 ms")
        );
        assert!(execution.output.is_fatal());
    }

    #[test]
    fn nul_in_case_id_does_not_panic_the_executor() {
        let case = CaseDescriptor::reference("a\0b", "x");
        let execution = Executor::new(Duration::from_secs(5)).execute(&case, &echo_runtime());
        assert!(execution.fault.is_none());
        assert_eq!(execution.output.text, "x\n");
    }

    #[test]
    fn panicking_runtime_becomes_crash() {
        let runtime: Arc<dyn Runtime> = Arc::new(FnRuntime::new("panicky", |_: &str| {
            panic!("interpreter bug");
        }));
        let case = CaseDescriptor::reference("panics", "1");
        let execution = Executor::default().execute(&case, &runtime);
        match execution.fault {
            Some(ExecutionFault::Crash { diagnostic }) => {
                assert!(diagnostic.contains("interpreter bug"), "{diagnostic}");
            }
            other => panic!("expected crash, got {other:?}"),
        }
        assert!(execution.output.is_fatal());
    }

    #[test]
    fn runtime_errors_map_to_fault_kinds() {
        let unavailable = RuntimeError::Unavailable {
            runtime: "R".to_owned(),
            detail: "not installed".to_owned(),
        };
        assert!(matches!(
            unavailable.into_fault(),
            ExecutionFault::Unavailable { .. }
        ));
        assert_eq!(
            RuntimeError::DeadlineExceeded { timeout_ms: 7 }.into_fault(),
            ExecutionFault::Timeout { timeout_ms: 7 }
        );
        assert!(matches!(
            RuntimeError::Protocol("bad json".to_owned()).into_fault(),
            ExecutionFault::Crash { .. }
        ));
    }

    #[test]
    fn bindings_are_rendered_before_submission() {
        let runtime = echo_runtime();
        let case = CaseDescriptor::new(
            "argv",
            Snippet::with_bindings("f(argv)", vec![rc_types::ArgBinding::positional("1L")]),
            rc_types::Expectation::ReferenceEquivalence,
        );
        let execution = Executor::default().execute(&case, &runtime);
        assert_eq!(execution.output.text, "argv <- list(1L);f(argv)\n");
    }
}
