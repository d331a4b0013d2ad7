// Shell Runner
// Runs step and installer commands as subprocesses, capturing their output

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::warn;

/// Interpreter a command string is handed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Sh,
    Bash,
}

impl Shell {
    fn program(self) -> &'static str {
        match self {
            Shell::Sh => "sh",
            Shell::Bash => "bash",
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl std::str::FromStr for Shell {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sh" | "default" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            other => Err(format!("Unknown shell '{}'. Valid shells: sh, bash", other)),
        }
    }
}

/// Called once per output line with `(line, from_stderr)`
pub type OutputCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// What a finished (or unstartable) process left behind
#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process never started, was killed, or timed out
    pub exit_code: Option<i32>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, blank streams omitted
    pub fn combined(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn not_started(reason: String) -> Self {
        Self {
            stderr: reason,
            ..Self::default()
        }
    }
}

/// One command to run: the script body plus everything it needs
pub struct Script<'a> {
    body: &'a str,
    dir: &'a Path,
    env: Option<&'a HashMap<String, String>>,
    input: Option<Vec<u8>>,
    on_line: Option<OutputCallback>,
}

impl<'a> Script<'a> {
    pub fn new(body: &'a str, dir: &'a Path) -> Self {
        Self {
            body,
            dir,
            env: None,
            input: None,
            on_line: None,
        }
    }

    /// Variables added on top of the inherited process environment
    pub fn env(mut self, env: &'a HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Bytes written to the child's stdin, which is then closed
    pub fn stdin(mut self, input: Vec<u8>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn on_line(mut self, callback: OutputCallback) -> Self {
        self.on_line = Some(callback);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: Shell,
    timeout: Option<Duration>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::for_shell(Shell::Sh)
    }

    pub fn for_shell(shell: Shell) -> Self {
        Self {
            shell,
            timeout: None,
        }
    }

    /// Kill commands that outlive `limit`. Steps run unbounded unless set.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn shell(&self) -> Shell {
        self.shell
    }

    /// Spawn `script` and wait for it. Never fails: a process that cannot
    /// start reports `exit_code: None` with the reason on stderr.
    pub async fn run(&self, script: Script<'_>) -> ShellOutput {
        let mut command = Command::new(self.shell.program());
        command
            .arg("-c")
            .arg(script.body)
            .current_dir(script.dir)
            .stdin(match script.input {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = script.env {
            command.envs(env);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ShellOutput::not_started(format!(
                    "Failed to spawn {} in {}: {}",
                    self.shell,
                    script.dir.display(),
                    e
                ))
            }
        };

        if let (Some(bytes), Some(mut pipe)) = (script.input, child.stdin.take()) {
            // A child that exits without reading closes the pipe; that is not our error
            tokio::spawn(async move {
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            });
        }

        let (Some(out), Some(err)) = (child.stdout.take(), child.stderr.take()) else {
            return ShellOutput::not_started("child output pipes missing".to_string());
        };
        let out = drain(out, false, script.on_line.clone());
        let err = drain(err, true, script.on_line);

        let exit_code = match self.wait(&mut child).await {
            Ok(code) => code,
            Err(limit) => {
                let _ = child.kill().await;
                return ShellOutput {
                    stdout: out.await.unwrap_or_default(),
                    stderr: format!("Process timed out after {:?}", limit),
                    exit_code: None,
                };
            }
        };

        ShellOutput {
            stdout: out.await.unwrap_or_default(),
            stderr: err.await.unwrap_or_default(),
            exit_code,
        }
    }

    /// Exit code of the child, or `Err(limit)` when the timeout elapsed
    async fn wait(&self, child: &mut Child) -> Result<Option<i32>, Duration> {
        let status = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait())
                .await
                .map_err(|_| limit)?,
            None => child.wait().await,
        };
        Ok(status.ok().and_then(|s| s.code()))
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a pipe to EOF, forwarding each line, and return the joined text.
///
/// Bytes that are not UTF-8 are replaced rather than ending the read, so the
/// child never writes into a closed pipe.
fn drain<R>(pipe: R, stderr: bool, on_line: Option<OutputCallback>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut raw = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&raw);
                    if let Some(forward) = &on_line {
                        forward(&line, stderr);
                    }
                    seen.push(line);
                }
                Err(e) => {
                    warn!(error = %e, "reading process output failed");
                    break;
                }
            }
        }
        seen.join("\n")
    })
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;
    use std::sync::Mutex;

    fn here() -> PathBuf {
        std::env::current_dir().unwrap()
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let dir = here();
        let output = ShellRunner::new().run(Script::new("echo hello", &dir)).await;

        assert!(output.success());
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr, "");
    }

    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr() {
        let dir = here();
        let output = ShellRunner::new()
            .run(Script::new("echo oops >&2; exit 3", &dir))
            .await;

        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr, "oops");
        assert_eq!(output.combined(), "oops");
    }

    #[tokio::test]
    async fn test_env_and_directory_apply() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("GREETING".to_string(), "hi".to_string())]);

        let output = ShellRunner::new()
            .run(Script::new("echo $GREETING > out.txt && cat out.txt", dir.path()).env(&env))
            .await;

        assert_eq!(output.stdout, "hi");
        assert!(dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = here();
        let output = ShellRunner::new()
            .with_timeout(Duration::from_millis(100))
            .run(Script::new("sleep 5", &dir))
            .await;

        assert_eq!(output.exit_code, None);
        assert!(output.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_lines_are_forwarded_with_stream() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let collector = seen.clone();
        let callback: OutputCallback = Arc::new(move |line, from_stderr| {
            collector.lock().unwrap().push((line.to_string(), from_stderr));
        });

        let dir = here();
        let output = ShellRunner::for_shell(Shell::Bash)
            .run(Script::new("echo one; echo two >&2", &dir).on_line(callback))
            .await;

        assert!(output.success());
        assert_eq!(output.combined(), "one\ntwo");
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&("one".to_string(), false)));
        assert!(seen.contains(&("two".to_string(), true)));
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let dir = here();
        let output = ShellRunner::new()
            .run(Script::new("cat", &dir).stdin(b"payload".to_vec()))
            .await;

        assert_eq!(output.stdout, "payload");
    }

    #[tokio::test]
    async fn test_invalid_utf8_keeps_reading_to_exit() {
        let dir = here();
        let script = r"printf 'caf\351\n'; sleep 0.2; i=0; while [ $i -lt 2000 ]; do echo line$i; i=$((i+1)); done; exit 0";
        let output = ShellRunner::new().run(Script::new(script, &dir)).await;

        assert!(output.success(), "stderr: {}", output.stderr);
        let lines: Vec<&str> = output.stdout.lines().collect();
        assert_eq!(lines.len(), 2001);
        assert_eq!(lines[0], "caf\u{FFFD}");
        assert_eq!(lines[2000], "line1999");
    }

    #[test]
    fn test_decode_line_strips_terminators() {
        assert_eq!(decode_line(b"plain\r\n"), "plain");
        assert_eq!(decode_line(b"last"), "last");
        assert_eq!(decode_line(b"\xff\n"), "\u{FFFD}");
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_started() {
        let output = ShellRunner::new()
            .run(Script::new("echo hi", Path::new("/definitely/not/here")))
            .await;

        assert_eq!(output.exit_code, None);
        assert!(output.stderr.starts_with("Failed to spawn sh"));
    }

    #[test]
    fn test_shell_names() {
        assert_eq!("sh".parse::<Shell>(), Ok(Shell::Sh));
        assert_eq!("default".parse::<Shell>(), Ok(Shell::Sh));
        assert_eq!("bash".parse::<Shell>(), Ok(Shell::Bash));
        assert!("fish".parse::<Shell>().is_err());
        assert_eq!(Shell::Bash.to_string(), "bash");
    }
}
