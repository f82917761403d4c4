//! Kernels running as child processes
//!
//! The child reads one JSON request per line on stdin:
//!
//! ```text
//! {"code": "a = 1", "execution_count": 1}
//! ```
//!
//! and answers each with one line on stdout, prefixed by the ASCII record
//! separator (`0x1E`):
//!
//! ```text
//! \x1e{"status": "ok", "outputs": [...]}
//! \x1e{"status": "error", "ename": "...", "evalue": "...", "traceback": [...], "outputs": [...]}
//! ```
//!
//! `outputs` are nbformat 4 output objects. Lines without the prefix (stray
//! writes from native code, interpreter banners) are ignored. The embedded
//! [`PYTHON_DRIVER`] implements this protocol for Python; any other runtime can
//! be plugged in through [`KernelCommand`].

use crate::error::{KernelError, Result};
use crate::kernel::{CellFailure, CellReply, Kernel, KernelLauncher, KernelSpec, DEFAULT_KERNEL};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use nbstatic_notebook::Output;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Python side of the line protocol
pub const PYTHON_DRIVER: &str = include_str!("driver.py");

/// Argument replaced by [`PYTHON_DRIVER`] when building a kernel command line
pub const DRIVER_PLACEHOLDER: &str = "{driver}";

/// Environment variable telling the Python driver which figure format to emit
pub const FIGURE_FORMAT_ENV: &str = "NBSTATIC_FIGURE_FORMAT";

const REPLY_PREFIX: char = '\u{1e}';
const STDERR_TAIL_CHARS: usize = 4096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Command line (and extra environment) used to start one kind of kernel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KernelCommand {
    /// Program followed by its arguments; `{driver}` expands to the Python driver
    pub command: Vec<String>,
    /// Extra environment variables for the kernel process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl KernelCommand {
    /// Build a command from a program and its arguments
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Embedded Python driver run by `interpreter`
    #[must_use]
    pub fn python(interpreter: &str) -> Self {
        Self::new([interpreter, "-u", "-c", DRIVER_PLACEHOLDER])
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build(&self, name: &str) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| KernelError::EmptyCommand(name.to_string()))?;
        let mut cmd = Command::new(program);
        for arg in args {
            if arg == DRIVER_PLACEHOLDER {
                cmd.arg(PYTHON_DRIVER);
            } else {
                cmd.arg(arg);
            }
        }
        Ok(cmd)
    }
}

/// Launches [`SubprocessKernel`]s from a kernel-name → command table
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    commands: BTreeMap<String, KernelCommand>,
    env: BTreeMap<String, String>,
}

impl Default for SubprocessLauncher {
    /// `python3` and `python` run the embedded driver with `python3`
    fn default() -> Self {
        Self::empty()
            .with_kernel(DEFAULT_KERNEL, KernelCommand::python("python3"))
            .with_kernel("python", KernelCommand::python("python3"))
    }
}

impl SubprocessLauncher {
    /// Launcher with no kernels registered
    #[must_use]
    pub fn empty() -> Self {
        Self {
            commands: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    /// Register (or replace) the command for kernel `name`
    #[must_use]
    pub fn with_kernel(mut self, name: impl Into<String>, command: KernelCommand) -> Self {
        self.commands.insert(name.into(), command);
        self
    }

    /// Set an environment variable for every kernel started by this launcher
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command for `spec`: exact name, then language, then case-insensitive
    #[must_use]
    pub fn resolve(&self, spec: &KernelSpec) -> Option<&KernelCommand> {
        let candidates = std::iter::once(spec.name.as_str()).chain(spec.language.as_deref());
        for candidate in candidates {
            if let Some(command) = self.commands.get(candidate) {
                return Some(command);
            }
            if let Some((_, command)) = self
                .commands
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(candidate))
            {
                return Some(command);
            }
        }
        None
    }
}

impl KernelLauncher for SubprocessLauncher {
    fn launch(&self, spec: &KernelSpec, working_dir: &Path) -> Result<Box<dyn Kernel>> {
        let command = self
            .resolve(spec)
            .ok_or_else(|| KernelError::UnknownKernel(spec.name.clone()))?;
        let kernel = SubprocessKernel::spawn(&spec.name, command, working_dir, &self.env)?;
        Ok(Box::new(kernel))
    }
}

/// A kernel process speaking the line protocol
pub struct SubprocessKernel {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    replies: Receiver<String>,
    stderr: StderrTail,
}

impl SubprocessKernel {
    /// Start `command` in `working_dir`
    ///
    /// # Errors
    ///
    /// Returns an error if the command is empty or the process cannot start.
    pub fn spawn(
        name: &str,
        command: &KernelCommand,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = command.build(name)?;
        cmd.current_dir(working_dir)
            .envs(env)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| KernelError::Spawn {
            name: name.to_string(),
            source,
        })?;
        debug!(
            kernel = name,
            pid = child.id(),
            dir = %working_dir.display(),
            "Started kernel"
        );

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(KernelError::Protocol(
                        "kernel pipes not captured".to_string(),
                    ));
                }
            };

        let (tx, replies) = crossbeam_channel::unbounded();
        let kernel_name = name.to_string();
        std::thread::Builder::new()
            .name(format!("kernel-{name}-stdout"))
            .spawn(move || {
                for_each_line(stdout, |line| {
                    if let Some(reply) = line.strip_prefix(REPLY_PREFIX) {
                        return tx.send(reply.to_string()).is_ok();
                    }
                    trace!(kernel = %kernel_name, "{line}");
                    true
                });
            })?;

        Ok(Self {
            name: name.to_string(),
            child,
            stdin: Some(stdin),
            replies,
            stderr: StderrTail::capture(name, stderr)?,
        })
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    /// Describe why the process went away
    fn death(&mut self) -> KernelError {
        died(&self.name, &mut self.child, &mut self.stderr)
    }
}

/// [`KernelError::Died`] for a kernel process that went away
pub(crate) fn died(name: &str, child: &mut Child, stderr: &mut StderrTail) -> KernelError {
    let status = match child.wait() {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    };
    let tail = stderr.finish();
    KernelError::Died {
        name: name.to_string(),
        status,
        stderr: if tail.is_empty() {
            String::new()
        } else {
            format!(": {tail}")
        },
    }
}

/// Last few KiB a kernel process wrote to stderr
pub(crate) struct StderrTail {
    text: Arc<Mutex<String>>,
    reader: Option<JoinHandle<()>>,
}

impl StderrTail {
    /// Start draining `stderr` on a background thread
    pub(crate) fn capture(name: &str, stderr: ChildStderr) -> std::io::Result<Self> {
        let text = Arc::new(Mutex::new(String::new()));
        let tail = Arc::clone(&text);
        let reader = std::thread::Builder::new()
            .name(format!("kernel-{name}-stderr"))
            .spawn(move || {
                for_each_line(stderr, |line| {
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    tail.push_str(line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL_CHARS {
                        let mut cut = tail.len() - STDERR_TAIL_CHARS;
                        while !tail.is_char_boundary(cut) {
                            cut += 1;
                        }
                        tail.drain(..cut);
                    }
                    true
                });
            })?;
        Ok(Self {
            text,
            reader: Some(reader),
        })
    }

    /// Trimmed tail, after giving the reader a moment to drain the pipe
    pub(crate) fn finish(&mut self) -> String {
        if let Some(reader) = self.reader.take() {
            let deadline = Instant::now() + Duration::from_millis(200);
            while !reader.is_finished() && Instant::now() < deadline {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        self.text
            .lock()
            .map(|t| t.trim().to_string())
            .unwrap_or_default()
    }
}

impl Kernel for SubprocessKernel {
    fn execute(
        &mut self,
        code: &str,
        execution_count: i64,
        timeout: Duration,
    ) -> Result<CellReply> {
        let request = serde_json::json!({
            "code": code,
            "execution_count": execution_count,
        });
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(KernelError::Protocol("kernel already shut down".to_string()));
        };
        let line = format!("{request}\n");
        if let Err(e) = stdin.write_all(line.as_bytes()).and_then(|()| stdin.flush()) {
            if e.kind() == ErrorKind::BrokenPipe {
                return Err(self.death());
            }
            return Err(e.into());
        }

        match self.replies.recv_timeout(timeout) {
            Ok(reply) => parse_reply(&reply),
            Err(RecvTimeoutError::Timeout) => {
                warn!(kernel = %self.name, ?timeout, "Kernel did not reply in time, killing it");
                self.kill();
                Err(KernelError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.death()),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!(kernel = %self.name, "Kernel ignored end of input, killing it");
                let _ = self.child.kill();
                self.child.wait()?;
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for SubprocessKernel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(kernel = %self.name, "Failed to stop kernel: {e}");
        }
    }
}

/// Feed every line of `reader` to `f` until EOF, a read error, or `f` returns false
///
/// Bytes that are not UTF-8 are replaced rather than ending the stream, since
/// native libraries inside a kernel write whatever they like.
fn for_each_line(reader: impl Read, mut f: impl FnMut(&str) -> bool) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if !f(&String::from_utf8_lossy(&buf)) {
            return;
        }
    }
}

#[derive(Deserialize)]
struct WireReply {
    status: String,
    #[serde(default)]
    outputs: Vec<Output>,
    #[serde(default)]
    ename: Option<String>,
    #[serde(default)]
    evalue: Option<String>,
    #[serde(default)]
    traceback: Vec<String>,
}

fn parse_reply(line: &str) -> Result<CellReply> {
    let wire: WireReply =
        serde_json::from_str(line).map_err(|e| KernelError::Protocol(e.to_string()))?;
    match wire.status.as_str() {
        "ok" => Ok(CellReply::ok(wire.outputs)),
        "error" => Ok(CellReply {
            outputs: wire.outputs,
            failure: Some(CellFailure {
                ename: wire.ename.unwrap_or_default(),
                evalue: wire.evalue.unwrap_or_default(),
                traceback: wire.traceback,
            }),
        }),
        other => Err(KernelError::Protocol(format!("unknown status '{other}'"))),
    }
}
