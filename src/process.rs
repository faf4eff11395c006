//! Shared subprocess runner.
//!
//! Every external tool invocation in this crate (`git`, `flatpak`) goes
//! through [`ProcessRunner`] so capture/failure semantics stay in one place:
//! stdout and stderr are captured as bytes, and a non-zero exit status is
//! turned into a [`ProcessError`] rather than silently returning partial
//! output. There is no timeout; callers classify a failure as fatal to the
//! whole check or fatal to just one submodule/extension, they never retry.

use std::ffi::OsStr;
use std::path::Path;

use tokio::process::Command;

use crate::errors::ProcessError;

/// Captured output of a successful subprocess invocation.
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout_string().lines().map(str::to_owned).collect()
    }
}

/// Runs external programs, capturing output and classifying failures.
///
/// Invocable from any tokio task; subprocess I/O is inherently off the
/// calling task's synchronous critical path because `tokio::process`
/// multiplexes child I/O on the runtime's reactor.
#[derive(Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        ProcessRunner
    }

    /// Run `program args...` with an optional working directory.
    pub async fn run<I, S>(
        &self,
        program: &str,
        args: I,
        current_dir: Option<&Path>,
    ) -> Result<ProcessOutput, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect();

        let mut cmd = Command::new(program);
        cmd.args(&args);
        if let Some(dir) = current_dir {
            cmd.current_dir(dir);
        }

        log::debug!("running: {} {}", program, args.join(" "));

        let output = cmd.output().await.map_err(|source| ProcessError::Spawn {
            program: program.to_owned(),
            source,
        })?;

        if !output.status.success() {
            return Err(ProcessError::NonZeroExit {
                program: program.to_owned(),
                args: args.join(" "),
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_owned()),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(ProcessOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Convenience for `git -C <dir> <args...>`.
    pub async fn git<I, S>(&self, dir: &Path, args: I) -> Result<ProcessOutput, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut full_args: Vec<String> = vec!["-C".to_owned(), dir.to_string_lossy().into_owned()];
        full_args.extend(args.into_iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
        self.run("git", full_args, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let runner = ProcessRunner::new();
        let out = runner.run("echo", ["hello"], None).await.unwrap();
        assert_eq!(out.stdout_string().trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let runner = ProcessRunner::new();
        let err = runner.run("false", Vec::<String>::new(), None).await.unwrap_err();
        matches!(err, ProcessError::NonZeroExit { .. });
    }

    #[tokio::test]
    async fn git_prefixes_dash_c() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new();
        runner
            .run("git", ["init", "-q"], Some(dir.path()))
            .await
            .unwrap();
        let out = runner.git(dir.path(), ["rev-parse", "--show-toplevel"]).await.unwrap();
        assert!(!out.stdout_string().trim().is_empty());
    }
}
