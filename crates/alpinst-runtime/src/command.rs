use crate::RuntimeError;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use wait_timeout::ChildExt;

/// One external program call. Arguments are passed verbatim, never through a
/// shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Extra environment for this call only, on top of the installer's own.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
        }
    }

    /// `chroot <root> <program>`; used for tools that must run inside the
    /// target system.
    pub fn chroot(root: &Path, program: impl Into<String>) -> Self {
        Self::new("chroot")
            .arg(root.to_string_lossy())
            .arg(program)
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program actually executed, looking through a `chroot` prefix.
    pub fn effective_program(&self) -> &str {
        if self.program == "chroot" {
            if let Some(p) = self.args.get(1) {
                return p;
            }
        }
        &self.program
    }

    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion within `timeout`. A non-zero exit is always an
    /// error carrying the exit status and stderr.
    fn run(&self, invocation: &Invocation, timeout: Duration)
        -> Result<CommandOutput, RuntimeError>;

    /// Wait for a device node or file to appear.
    fn wait_for_path(&self, path: &Path, timeout: Duration) -> Result<(), RuntimeError> {
        let deadline = Instant::now() + timeout;
        while !path.exists() {
            if Instant::now() >= deadline {
                return Err(RuntimeError::DeviceMissing(path.display().to_string()));
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }
}

/// Runs programs on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl HostRunner {
    pub fn new() -> Self {
        Self
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Write `input` on its own thread so a child that fills its output pipes
/// before reading stdin cannot stall the caller past the deadline.
fn feed<W: Write + Send + 'static>(
    pipe: Option<W>,
    input: Option<String>,
) -> Option<thread::JoinHandle<std::io::Result<()>>> {
    let (mut pipe, input) = (pipe?, input?);
    Some(thread::spawn(move || pipe.write_all(input.as_bytes())))
}

impl CommandRunner for HostRunner {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        debug!("exec: {}", invocation.display());
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let feeder = feed(child.stdin.take(), invocation.stdin.clone());

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RuntimeError::Timeout {
                    program: invocation.effective_program().to_owned(),
                    secs: timeout.as_secs(),
                });
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };
        if let Some(Err(e)) = feeder.and_then(|h| h.join().ok()) {
            // A child may exit without reading all of its input.
            if e.kind() != ErrorKind::BrokenPipe {
                debug!("writing stdin of {}: {e}", invocation.program);
            }
        }

        let output = CommandOutput {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        };
        trace!("{} -> {status}", invocation.program);

        if status.success() {
            Ok(output)
        } else {
            Err(RuntimeError::CommandFailed {
                program: invocation.effective_program().to_owned(),
                status: status
                    .code()
                    .map_or_else(|| "signal".to_owned(), |c| format!("status {c}")),
                stderr: output.stderr.trim().to_owned(),
            })
        }
    }
}

/// A runner bound to one step's time budget. Every call receives whatever
/// is left of the budget, so a step as a whole cannot outlive it.
pub struct Session<'a> {
    runner: &'a dyn CommandRunner,
    budget: Duration,
    deadline: Instant,
}

impl<'a> Session<'a> {
    pub fn new(runner: &'a dyn CommandRunner, budget: Duration) -> Self {
        Self {
            runner,
            budget,
            deadline: Instant::now() + budget,
        }
    }

    fn remaining(&self, program: &str) -> Result<Duration, RuntimeError> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(RuntimeError::Timeout {
                program: program.to_owned(),
                secs: self.budget.as_secs(),
            });
        }
        Ok(left)
    }

    pub fn run(&self, invocation: &Invocation) -> Result<CommandOutput, RuntimeError> {
        let left = self.remaining(invocation.effective_program())?;
        match self.runner.run(invocation, left) {
            Err(RuntimeError::Timeout { program, .. }) => Err(RuntimeError::Timeout {
                program,
                secs: self.budget.as_secs(),
            }),
            other => other,
        }
    }

    /// Wait for `path`, but never longer than `cap` or the remaining budget.
    pub fn wait_for_path(&self, path: &Path, cap: Duration) -> Result<(), RuntimeError> {
        let left = self.remaining("wait")?;
        self.runner.wait_for_path(path, left.min(cap))
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_builder() {
        let inv = Invocation::new("mkfs.ext4")
            .arg("-F")
            .args(["-L", "root"])
            .arg("/dev/sda2");
        assert_eq!(inv.display(), "mkfs.ext4 -F -L root /dev/sda2");
        assert!(inv.stdin.is_none());
    }

    #[test]
    fn chroot_reports_inner_program() {
        let inv = Invocation::chroot(Path::new("/mnt/target"), "adduser").arg("-D");
        assert_eq!(inv.program, "chroot");
        assert_eq!(inv.args, ["/mnt/target", "adduser", "-D"]);
        assert_eq!(inv.effective_program(), "adduser");
    }

    #[test]
    fn host_runner_captures_stdout() {
        let out = HostRunner
            .run(
                &Invocation::new("sh").args(["-c", "echo hello"]),
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn host_runner_feeds_stdin() {
        let out = HostRunner
            .run(
                &Invocation::new("cat").stdin("piped text"),
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(out.stdout, "piped text");
    }

    #[test]
    fn host_runner_passes_invocation_env() {
        let out = HostRunner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "echo $http_proxy"])
                    .env("http_proxy", "http://proxy:3128"),
                Duration::from_secs(10),
            )
            .unwrap();
        assert_eq!(out.stdout.trim(), "http://proxy:3128");
    }

    #[test]
    fn large_stdin_does_not_block_on_full_stdout() {
        // Writes its own output before reading, so stdin and stdout pipes
        // both fill up unless they are serviced concurrently.
        let input = "x".repeat(1 << 20);
        let out = HostRunner
            .run(
                &Invocation::new("sh")
                    .args(["-c", "head -c 1048576 /dev/zero; cat >/dev/null; echo done >&2"])
                    .stdin(input),
                Duration::from_secs(20),
            )
            .unwrap();
        assert_eq!(out.stdout.len(), 1 << 20);
        assert_eq!(out.stderr.trim(), "done");
    }

    #[test]
    fn child_ignoring_stdin_still_reports_status() {
        let err = HostRunner
            .run(
                &Invocation::new("sh").args(["-c", "exit 4"]).stdin("x".repeat(1 << 20)),
                Duration::from_secs(10),
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { ref status, .. } if status == "status 4"));
    }

    #[test]
    fn host_runner_reports_exit_status_and_stderr() {
        let err = HostRunner
            .run(
                &Invocation::new("sh").args(["-c", "echo broken >&2; exit 3"]),
                Duration::from_secs(10),
            )
            .unwrap_err();
        match err {
            RuntimeError::CommandFailed {
                program,
                status,
                stderr,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(status, "status 3");
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn host_runner_kills_on_timeout() {
        let start = Instant::now();
        let err = HostRunner
            .run(
                &Invocation::new("sleep").arg("5"),
                Duration::from_millis(200),
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let err = HostRunner
            .run(
                &Invocation::new("alpinst-no-such-tool"),
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[test]
    fn session_rejects_calls_after_deadline() {
        let session = Session::new(&HostRunner, Duration::from_millis(0));
        let err = session.run(&Invocation::new("true")).unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { ref program, .. } if program == "true"));
    }

    #[test]
    fn session_timeout_reports_step_budget() {
        let session = Session::new(&HostRunner, Duration::from_secs(1));
        let err = session
            .run(&Invocation::new("sleep").arg("5"))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { secs: 1, .. }));
    }
}
