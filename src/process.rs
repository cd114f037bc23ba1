//! External command execution
//!
//! Every acquisition unit talks to the outside world through a
//! [`ProcessRunner`]: either running a command to completion with captured
//! output, or spawning it and reading stdout line by line while stderr is
//! buffered in the background. Secrets registered on a [`CommandSpec`] are
//! masked whenever the command line is rendered for logs or errors.

use crate::error::ProcessError;
use log::debug;
use std::env;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

/// Replacement text for secrets in rendered command lines
pub const REDACTED: &str = "<PW>";

/// Program plus argument vector, with optional secret arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    secrets: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            secrets: Vec::new(),
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

    /// Append an argument that must never appear in logs
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        let arg = arg.into();
        if !arg.is_empty() {
            self.secrets.push(arg.clone());
        }
        self.args.push(arg);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Renders the command line with secrets masked
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&self.redact(&line))
    }
}

/// Output of a command that ran to successful completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A running command whose stdout is consumed incrementally
pub trait StreamingProcess: Send {
    /// Read the next stdout line into `buf`, returning 0 at end of output
    ///
    /// Bytes that are not valid UTF-8 are replaced, never reported as errors.
    fn read_line(&mut self, buf: &mut String) -> io::Result<usize>;

    /// Wait for exit; a non-zero status yields `ProcessError::NonZeroExit`
    /// carrying the captured stderr
    fn wait(self: Box<Self>) -> Result<(), ProcessError>;
}

/// Launches external commands on behalf of acquisition units
#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion and capture stdout and stderr
    fn run(&self, spec: &CommandSpec) -> Result<CapturedOutput, ProcessError>;

    /// Start the command with stdout available for streaming
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn StreamingProcess>, ProcessError>;
}

/// [`ProcessRunner`] backed by `std::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CapturedOutput, ProcessError> {
        debug!("Running command: {}", spec);

        let output = spec
            .to_command()
            .output()
            .map_err(|source| ProcessError::Spawn {
                command: spec.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ProcessError::NonZeroExit {
                command: spec.to_string(),
                status: output.status.to_string(),
                stdout: spec.redact(&stdout),
                stderr: spec.redact(&stderr),
            });
        }

        Ok(CapturedOutput { stdout, stderr })
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn StreamingProcess>, ProcessError> {
        debug!("Spawning command: {}", spec);

        let mut child = spec
            .to_command()
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: spec.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            ProcessError::IoError(io::Error::new(
                io::ErrorKind::Other,
                "child stdout was not piped",
            ))
        })?;

        // Drain stderr on its own thread so a chatty command cannot block on a full pipe
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        Ok(Box::new(SystemProcess {
            spec: spec.clone(),
            child,
            stdout: BufReader::new(stdout),
            stderr_reader,
        }))
    }
}

struct SystemProcess {
    spec: CommandSpec,
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr_reader: Option<JoinHandle<String>>,
}

impl StreamingProcess for SystemProcess {
    fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        read_lossy_line(&mut self.stdout, buf)
    }

    fn wait(mut self: Box<Self>) -> Result<(), ProcessError> {
        // Unread output would keep the child blocked on write
        let drained = io::copy(&mut self.stdout, &mut io::sink());
        if drained.is_err() {
            let _ = self.child.kill();
        }

        let status = self.child.wait()?;
        drained?;
        let stderr = self
            .stderr_reader
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::NonZeroExit {
                command: self.spec.to_string(),
                status: status.to_string(),
                stdout: String::new(),
                stderr: self.spec.redact(&stderr),
            })
        }
    }
}

/// Read up to and including the next `\n`, decoding invalid UTF-8 lossily
pub(crate) fn read_lossy_line<R: BufRead>(reader: &mut R, buf: &mut String) -> io::Result<usize> {
    let mut raw = Vec::new();
    let read = reader.read_until(b'\n', &mut raw)?;
    buf.push_str(&String::from_utf8_lossy(&raw));
    Ok(read)
}

/// Locate an executable the way a shell would
///
/// Names containing a `/` are checked directly; bare names are searched in
/// `PATH`.
pub fn resolve_binary(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    if name.contains('/') {
        let path = Path::new(name);
        return is_executable(path).then(|| path.to_path_buf());
    }

    let search_path = env::var_os("PATH")?;
    env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Whether the process runs with an effective uid of root
pub fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-ins for running commands

    use super::*;
    use std::io::Cursor;

    /// Streaming process replaying canned stdout and exit result
    pub struct ScriptedProcess {
        stdout: Cursor<Vec<u8>>,
        exit: Option<(String, String)>,
        command: String,
    }

    impl ScriptedProcess {
        pub fn success(stdout: &str) -> Box<dyn StreamingProcess> {
            Box::new(Self {
                stdout: Cursor::new(stdout.as_bytes().to_vec()),
                exit: None,
                command: "scripted".to_string(),
            })
        }

        /// Replays raw stdout bytes, which need not be valid UTF-8
        pub fn success_bytes(stdout: &[u8]) -> Box<dyn StreamingProcess> {
            Box::new(Self {
                stdout: Cursor::new(stdout.to_vec()),
                exit: None,
                command: "scripted".to_string(),
            })
        }

        pub fn failure(stdout: &str, status: &str, stderr: &str) -> Box<dyn StreamingProcess> {
            Box::new(Self {
                stdout: Cursor::new(stdout.as_bytes().to_vec()),
                exit: Some((status.to_string(), stderr.to_string())),
                command: "scripted".to_string(),
            })
        }
    }

    impl StreamingProcess for ScriptedProcess {
        fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
            read_lossy_line(&mut self.stdout, buf)
        }

        fn wait(self: Box<Self>) -> Result<(), ProcessError> {
            match self.exit {
                None => Ok(()),
                Some((status, stderr)) => Err(ProcessError::NonZeroExit {
                    command: self.command,
                    status,
                    stdout: String::new(),
                    stderr,
                }),
            }
        }
    }
}
