//! Command execution seam.
//!
//! The transport never spawns processes directly; it goes through
//! [`CommandRunner`] so tests (and the daemon's mock mode) can script the
//! device-management tools instead of requiring hardware.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::process::Command;

/// Raw result of one tool invocation, both channels kept separate so the
/// transport can concatenate them deterministically.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub status_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { status_ok: true, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn ok_stderr(stderr: impl Into<String>) -> Self {
        Self { status_ok: true, stdout: String::new(), stderr: stderr.into() }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self { status_ok: false, stdout: String::new(), stderr: stderr.into() }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing exit status and both channels.
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput>;
}

/// Runner backed by real processes via `tokio::process`.
#[derive(Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput> {
        log::debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(RawOutput {
            status_ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Scripted runner for tests and mock mode.
///
/// Responses are matched by substring against the full command line, first
/// match wins. Unscripted commands fail with a recognizable message. Every
/// invocation is recorded so tests can assert what was (or was not) run.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Vec<(String, RawOutput)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond to any command line containing `needle` with `output`.
    #[must_use]
    pub fn on(mut self, needle: &str, output: RawOutput) -> Self {
        self.responses.push((needle.to_string(), output));
        self
    }

    #[must_use]
    pub fn on_ok(self, needle: &str, stdout: &str) -> Self {
        self.on(needle, RawOutput::ok(stdout))
    }

    /// Command lines seen so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("runner call log poisoned").clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().expect("runner call log poisoned").push(line.clone());

        for (needle, output) in &self.responses {
            if line.contains(needle.as_str()) {
                return Ok(output.clone());
            }
        }
        Ok(RawOutput::failed(format!("unscripted command: {line}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_runner_matches_in_order() {
        let runner = ScriptedRunner::new()
            .on_ok("getvar product", "product: guacamole")
            .on_ok("devices", "serial1\tfastboot");

        let out = runner
            .run("fastboot", &["devices".to_string()])
            .await
            .unwrap();
        assert!(out.status_ok);
        assert_eq!(out.stdout, "serial1\tfastboot");
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_runner_unscripted_fails() {
        let runner = ScriptedRunner::new();
        let out = runner
            .run("fastboot", &["oem".to_string(), "unlock".to_string()])
            .await
            .unwrap();
        assert!(!out.status_ok);
        assert!(out.stderr.contains("unscripted"));
    }
}
