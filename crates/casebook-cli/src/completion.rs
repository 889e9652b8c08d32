use crate::config::CompletionConfig;
use casebook_core::{
    CompletionError, CompletionFailureKind, CompletionGuardrails, CompletionOutput,
    CompletionRequest, CompletionService,
};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs an external program once per request. The request goes to stdin as
/// JSON; stdout must be one JSON object of field values.
#[derive(Debug, Clone)]
pub struct CommandCompletionService {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandCompletionService {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: format!("command:{program}"),
            program,
            args,
        }
    }
}

fn transport(message: impl Into<String>) -> CompletionError {
    CompletionError::new(CompletionFailureKind::Transport, message)
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buffer);
        }
        buffer
    })
}

/// Writes the request on its own thread so a child that never reads stdin
/// cannot hold the caller past the deadline.
fn feed<W: Write + Send + 'static>(sink: Option<W>, payload: Vec<u8>, program: String) {
    let Some(mut sink) = sink else {
        return;
    };
    thread::spawn(move || {
        if let Err(err) = sink.write_all(&payload) {
            debug!(event = "completion_stdin_closed", program = %program, error = %err);
        }
    });
}

impl CompletionService for CommandCompletionService {
    fn service_name(&self) -> &str {
        &self.name
    }

    fn complete(
        &self,
        request: &CompletionRequest,
        guardrails: &CompletionGuardrails,
    ) -> Result<CompletionOutput, CompletionError> {
        let deadline = Instant::now() + Duration::from_millis(guardrails.timeout_ms);
        let payload = serde_json::to_vec(request)
            .map_err(|err| transport(format!("encode request: {err}")))?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| transport(format!("spawn {}: {err}", self.program)))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        feed(child.stdin.take(), payload, self.program.clone());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(CompletionError::new(
                        CompletionFailureKind::Timeout,
                        format!("{} killed after {}ms", self.program, guardrails.timeout_ms),
                    ));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(transport(format!("wait {}: {err}", self.program))),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            let detail = stderr.trim();
            return Err(CompletionError::new(
                CompletionFailureKind::ProviderError,
                if detail.is_empty() {
                    format!("{} exited with {status}", self.program)
                } else {
                    format!("{} exited with {status}: {detail}", self.program)
                },
            ));
        }
        CompletionOutput::from_json_object(&stdout)
    }
}

/// The service the CLI runs with: the configured command, or a stand-in
/// that fails every request so ticks record why nothing was converted.
#[derive(Debug, Clone)]
pub enum ConfiguredCompletion {
    Command(CommandCompletionService),
    Missing,
}

impl ConfiguredCompletion {
    pub fn from_config(config: &CompletionConfig) -> Self {
        match config.command.as_deref().map(str::trim) {
            Some(program) if !program.is_empty() => {
                Self::Command(CommandCompletionService::new(program, config.args.clone()))
            }
            _ => Self::Missing,
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Command(_))
    }
}

impl CompletionService for ConfiguredCompletion {
    fn service_name(&self) -> &str {
        match self {
            Self::Command(service) => service.service_name(),
            Self::Missing => "unconfigured",
        }
    }

    fn complete(
        &self,
        request: &CompletionRequest,
        guardrails: &CompletionGuardrails,
    ) -> Result<CompletionOutput, CompletionError> {
        match self {
            Self::Command(service) => service.complete(request, guardrails),
            Self::Missing => Err(CompletionError::new(
                CompletionFailureKind::ProviderError,
                "no [completion] command configured",
            )),
        }
    }
}
