use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rc_types::{Output, TranscriptMarkers};
use serde::{Deserialize, Serialize};

use crate::{Runtime, RuntimeError, Session, duration_ms};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How a runtime process reports its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputProtocol {
    /// stdout is printed output; stderr is a console transcript carrying the
    /// error line and warning block.
    #[default]
    Console,
    /// stdout is one serialized `Output`.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub protocol: OutputProtocol,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RuntimeSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            protocol: OutputProtocol::Console,
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: OutputProtocol) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Evaluates programs in a fresh child process, program text on stdin.
///
/// The whole program of a case goes to one process, so snippets of a case
/// share interpreter state while separate cases never do.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    spec: RuntimeSpec,
    markers: TranscriptMarkers,
    deadline: Duration,
}

impl ProcessRuntime {
    #[must_use]
    pub fn new(spec: RuntimeSpec, markers: TranscriptMarkers, deadline: Duration) -> Self {
        Self {
            spec,
            markers,
            deadline,
        }
    }

    #[must_use]
    pub fn spec(&self) -> &RuntimeSpec {
        &self.spec
    }

    fn evaluate(&self, program: &str) -> Result<Output, RuntimeError> {
        let mut child = Command::new(&self.spec.command)
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: self.spec.command.clone(),
                source,
            })?;

        // Readers and the writer run off this thread so the deadline loop
        // below can always kill a child stuck on a full pipe.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let writer = feed(child.stdin.take(), program.as_bytes().to_vec());
        let status = self.wait_with_deadline(&mut child)?;
        if let Some(writer) = writer {
            writer
                .join()
                .map_err(|_| RuntimeError::Crashed("stdin writer thread panicked".to_owned()))??;
        }
        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;
        self.decode(status, &stdout, &stderr)
    }

    fn wait_with_deadline(&self, child: &mut Child) -> Result<ExitStatus, RuntimeError> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= self.deadline {
                child.kill()?;
                let _ = child.wait();
                return Err(RuntimeError::DeadlineExceeded {
                    timeout_ms: duration_ms(self.deadline),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn decode(&self, status: ExitStatus, stdout: &str, stderr: &str) -> Result<Output, RuntimeError> {
        match self.spec.protocol {
            OutputProtocol::Json => serde_json::from_str::<Output>(stdout).map_err(|err| {
                RuntimeError::Protocol(format!(
                    "{} wrote invalid output JSON ({err}); stderr={stderr}",
                    self.spec.name
                ))
            }),
            OutputProtocol::Console => {
                let diagnostics = Output::from_transcript(stderr, &self.markers);
                if !status.success() && diagnostics.error_message.is_none() {
                    return Err(RuntimeError::ProcessFailed {
                        status: status.code().unwrap_or(-1),
                        stderr: stderr.to_owned(),
                    });
                }
                let mut output = Output::text(stdout);
                output.text.push_str(&diagnostics.text);
                output.warnings = diagnostics.warnings;
                output.completed = diagnostics.error_message.is_none();
                output.error_message = diagnostics.error_message;
                Ok(output)
            }
        }
    }
}

struct ProcessSession {
    runtime: ProcessRuntime,
}

impl Session for ProcessSession {
    fn run_snippet(&mut self, source: &str) -> Result<Output, RuntimeError> {
        self.runtime.evaluate(source)
    }

    fn run_program(&mut self, snippets: &[String]) -> Result<Output, RuntimeError> {
        self.runtime.evaluate(&snippets.join("\n"))
    }
}

impl Runtime for ProcessRuntime {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn open_session(&self) -> Result<Box<dyn Session>, RuntimeError> {
        Ok(Box::new(ProcessSession {
            runtime: self.clone(),
        }))
    }
}

fn feed(
    stdin: Option<ChildStdin>,
    program: Vec<u8>,
) -> Option<JoinHandle<std::io::Result<()>>> {
    stdin.map(|mut stdin| {
        thread::spawn(move || match stdin.write_all(&program) {
            Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
            other => other,
        })
    })
}

fn drain<R>(pipe: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn collect(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<String, RuntimeError> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };
    let bytes = handle
        .join()
        .map_err(|_| RuntimeError::Crashed("pipe reader thread panicked".to_owned()))??;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
