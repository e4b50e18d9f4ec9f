//! Subprocess boundary shared by every engine adapter and the rclone remote.
//!
//! A [`CommandSpec`] describes one invocation, secrets included, without ever
//! printing them. A [`CommandRunner`] executes it under a deadline. The
//! system runner kills the child when the deadline passes.

use crate::backup::redacted::{RedactedString, REDACTED};
use itertools::Itertools;
use std::fmt::{Debug, Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use thiserror::Error;
use wait_timeout::ChildExt;

#[derive(Clone, PartialEq, Eq)]
pub enum CommandArg {
    Plain(String),
    Secret(RedactedString),
}

impl CommandArg {
    pub fn as_plain(&self) -> Option<&str> {
        match self {
            CommandArg::Plain(s) => Some(s.as_str()),
            CommandArg::Secret(_) => None,
        }
    }

    fn expose(&self) -> &str {
        match self {
            CommandArg::Plain(s) => s.as_str(),
            CommandArg::Secret(s) => s.inner().as_str(),
        }
    }
}

impl Display for CommandArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandArg::Plain(s) => f.write_str(s),
            CommandArg::Secret(_) => f.write_str(REDACTED),
        }
    }
}

impl Debug for CommandArg {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.to_string())
    }
}

/// One subprocess invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<CommandArg>,
    envs: Vec<(String, RedactedString)>,
    stdout_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdout_file: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(CommandArg::Plain(arg.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(args.into_iter().map(|a| CommandArg::Plain(a.into())));
        self
    }

    pub fn secret_arg(mut self, secret: &RedactedString) -> Self {
        self.args.push(CommandArg::Secret(secret.clone()));
        self
    }

    /// Environment variables are only ever used to hand over credentials.
    pub fn secret_env<S: Into<String>>(mut self, key: S, value: &RedactedString) -> Self {
        self.envs.push((key.into(), value.clone()));
        self
    }

    /// Redirects the child's stdout into `path` instead of capturing it.
    pub fn stdout_to<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.stdout_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[CommandArg] {
        &self.args
    }

    pub fn env_keys(&self) -> impl Iterator<Item = &str> {
        self.envs.iter().map(|(k, _)| k.as_str())
    }

    pub fn stdout_file(&self) -> Option<&Path> {
        self.stdout_file.as_deref()
    }

    /// Returns the plain argument right after `flag`, if any.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .skip_while(|a| a.as_plain() != Some(flag))
            .nth(1)
            .and_then(CommandArg::as_plain)
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.program)
        } else {
            write!(f, "{} {}", self.program, self.args.iter().join(" "))
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the child was terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn ok<S: Into<String>>(stdout: S) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed<S: Into<String>>(code: i32, stderr: S) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?} and was killed")]
    Timeout { program: String, timeout: Duration },
    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion or until `timeout` expires.
    ///
    /// A non-zero exit is not an error here; it is reported through
    /// [`CommandOutput::status`] for the caller to classify.
    fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, ProcessError>;
}

/// Runs commands as real child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, ProcessError> {
        let io_err = |source| ProcessError::Io {
            program: spec.program.clone(),
            source,
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(spec.args.iter().map(CommandArg::expose))
            .stdin(Stdio::null())
            .stderr(Stdio::piped());
        for (key, value) in &spec.envs {
            cmd.env(key, value.inner());
        }
        match &spec.stdout_file {
            Some(path) => {
                cmd.stdout(File::create(path).map_err(io_err)?);
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        tracing::debug!("Running `{}` with timeout {:?}", spec, timeout);
        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let deadline = Instant::now() + timeout;
        let (tx, rx) = mpsc::channel();
        let mut pending = 0;
        if let Some(stdout) = child.stdout.take() {
            drain(Stream::Stdout, stdout, tx.clone());
            pending += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            drain(Stream::Stderr, stderr, tx.clone());
            pending += 1;
        }
        drop(tx);

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::warn!("`{}` exceeded {:?}, killing it", spec, timeout);
                let _ = child.kill();
                let _ = child.wait();
                // Grandchildren may still hold the pipes, so the drain threads are detached.
                return Err(ProcessError::Timeout {
                    program: spec.program.clone(),
                    timeout,
                });
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io_err(e));
            }
        };

        // The child is gone but a background grandchild can keep a pipe open.
        let mut output = CommandOutput {
            status: status.code(),
            stdout: String::new(),
            stderr: String::new(),
        };
        for _ in 0..pending {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok((Stream::Stdout, text)) => output.stdout = text,
                Ok((Stream::Stderr, text)) => output.stderr = text,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        "`{}` exited but its output stayed open past {:?}",
                        spec,
                        timeout
                    );
                    return Err(ProcessError::Timeout {
                        program: spec.program.clone(),
                        timeout,
                    });
                }
            }
        }
        Ok(output)
    }
}

enum Stream {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(stream: Stream, mut reader: R, tx: Sender<(Stream, String)>) {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send((stream, String::from_utf8_lossy(&buf).into_owned()));
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Handler = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync>;

    /// Records every spec and answers through a closure.
    pub struct ScriptedRunner {
        handler: Handler,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&CommandSpec) -> Result<CommandOutput, ProcessError> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(
            &self,
            spec: &CommandSpec,
            _timeout: Duration,
        ) -> Result<CommandOutput, ProcessError> {
            self.calls.lock().unwrap().push(spec.clone());
            (self.handler)(spec)
        }
    }

    pub fn timeout_of(spec: &CommandSpec) -> ProcessError {
        ProcessError::Timeout {
            program: spec.program().to_string(),
            timeout: Duration::from_secs(3600),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_display_redacts_secrets() {
        let spec = CommandSpec::new("redis-cli")
            .args(["-h", "cache"])
            .secret_arg(&RedactedString::from("pa55"))
            .secret_env("REDISCLI_AUTH", &RedactedString::from("pa55"));

        let shown = spec.to_string();
        assert_eq!(shown, format!("redis-cli -h cache {REDACTED}"));
        assert!(!format!("{spec:?}").contains("pa55"));
        assert_eq!(spec.env_keys().collect_vec(), vec!["REDISCLI_AUTH"]);
    }

    #[test]
    fn test_value_of() {
        let spec = CommandSpec::new("pg_dump").args(["-h", "db", "-d", "app"]);
        assert_eq!(spec.value_of("-d"), Some("app"));
        assert_eq!(spec.value_of("-h"), Some("db"));
        assert_eq!(spec.value_of("-f"), None);
    }

    #[test]
    fn test_system_runner_captures_output() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]);
        let out = SystemRunner.run(&spec, Duration::from_secs(10)).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn test_system_runner_reports_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "exit 3"]);
        let out = SystemRunner.run(&spec, Duration::from_secs(10)).unwrap();
        assert!(!out.success());
        assert_eq!(out.status, Some(3));
    }

    #[test]
    fn test_system_runner_passes_secret_env() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "printf %s \"$DUMP_SECRET\""])
            .secret_env("DUMP_SECRET", &RedactedString::from("s3cret"));
        let out = SystemRunner.run(&spec, Duration::from_secs(10)).unwrap();
        assert_eq!(out.stdout, "s3cret");
    }

    #[test]
    fn test_system_runner_redirects_stdout() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("dump.sql");
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo 'CREATE TABLE t();'"])
            .stdout_to(&target);
        let out = SystemRunner.run(&spec, Duration::from_secs(10)).unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
        assert_eq!(
            std::fs::read_to_string(&target).unwrap().trim(),
            "CREATE TABLE t();"
        );
    }

    #[test]
    fn test_system_runner_kills_on_timeout() {
        let spec = CommandSpec::new("sleep").arg("5");
        let started = std::time::Instant::now();
        let res = SystemRunner.run(&spec, Duration::from_millis(200));
        assert!(matches!(res, Err(ProcessError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_system_runner_bounded_when_output_held_open() {
        let spec = CommandSpec::new("sh").args(["-c", "sleep 6 & echo started"]);
        let started = std::time::Instant::now();
        let res = SystemRunner.run(&spec, Duration::from_millis(500));
        assert!(matches!(res, Err(ProcessError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_system_runner_spawn_failure() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-4242");
        let res = SystemRunner.run(&spec, Duration::from_secs(1));
        assert!(matches!(res, Err(ProcessError::Spawn { .. })));
    }
}
