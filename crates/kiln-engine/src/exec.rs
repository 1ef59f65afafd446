//! Child process execution with line-by-line log forwarding.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use kiln_types::{KilnError, KilnResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Program plus argument vector. Arguments are passed to the child as-is,
/// never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-quoted command line, for logs and error messages.
    pub fn display(&self) -> String {
        let parts: Vec<&str> = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect();
        shlex::try_join(parts.iter().copied()).unwrap_or_else(|_| parts.join(" "))
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

/// Runs external tools and streams their combined output into the log.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    working_dir: Option<PathBuf>,
    env_vars: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Upper bound on the child's run time; the child is killed once it passes.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Run to completion, forwarding every output line to the log.
    pub async fn run(&self, spec: &CommandSpec) -> KilnResult<()> {
        self.run_streaming(spec, |_| {}).await
    }

    /// Run to completion, forwarding every stdout/stderr line to the log and
    /// to `on_line` as it arrives. A non-zero exit fails with the exit code and
    /// the command line.
    pub async fn run_streaming<F>(&self, spec: &CommandSpec, mut on_line: F) -> KilnResult<()>
    where
        F: FnMut(&str) + Send,
    {
        let command_line = spec.display();
        debug!("Executing command: {}", command_line);
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let drive = async {
            let mut child = cmd.spawn()?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_lines(stdout, tx.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_lines(stderr, tx.clone()));
            }
            drop(tx);

            while let Some(line) = rx.recv().await {
                info!(target: "kiln::subprocess", "{}", line);
                on_line(&line);
            }
            child.wait().await
        };

        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, drive).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("Command timed out after {:?}: {}", limit, command_line);
                    return Err(KilnError::Timeout {
                        seconds: limit.as_secs(),
                        command: command_line,
                    });
                }
            },
            None => drive.await?,
        };

        if status.success() {
            debug!("Command succeeded in {:?}", start.elapsed());
            Ok(())
        } else {
            let code = status.code().unwrap_or(-1);
            warn!("Command failed with exit code {} in {:?}", code, start.elapsed());
            Err(KilnError::Subprocess {
                code,
                command: command_line,
            })
        }
    }
}

async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read child output: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn success_streams_both_streams() {
        let mut lines = Vec::new();
        CommandRunner::new()
            .run_streaming(&sh("echo hello; echo oops >&2"), |l| lines.push(l.to_string()))
            .await
            .unwrap();

        lines.sort();
        assert_eq!(lines, vec!["hello".to_string(), "oops".to_string()]);
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_command() {
        let err = CommandRunner::new().run(&sh("exit 2")).await.unwrap_err();

        assert_eq!(err.exit_code(), Some(2));
        match err {
            KilnError::Subprocess { command, .. } => {
                assert_eq!(shlex::split(&command).unwrap(), vec!["sh", "-c", "exit 2"])
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn applies_env_and_working_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();

        let mut lines = Vec::new();
        CommandRunner::new()
            .working_dir(dir.path())
            .env("KILN_TEST_VALUE", "forty-two")
            .run_streaming(&sh("echo $KILN_TEST_VALUE; ls"), |l| lines.push(l.to_string()))
            .await
            .unwrap();

        assert_eq!(lines, vec!["forty-two".to_string(), "marker.txt".to_string()]);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let err = CommandRunner::new()
            .timeout(Duration::from_millis(100))
            .run(&CommandSpec::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let err = CommandRunner::new()
            .run(&CommandSpec::new("kiln-definitely-not-installed"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Io(_)));
    }

    #[test]
    fn display_quotes_arguments() {
        let spec = CommandSpec::new("accelerate")
            .arg("launch")
            .arg("--instance_prompt=an HCON, in the style of TOK");
        assert_eq!(
            shlex::split(&spec.to_string()).unwrap(),
            vec![
                "accelerate",
                "launch",
                "--instance_prompt=an HCON, in the style of TOK"
            ]
        );
    }
}
