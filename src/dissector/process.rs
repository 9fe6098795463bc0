use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, error, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::error_handling::types::{bounded_diagnostic, ForensicError};

/// Most stderr bytes kept from a child process.
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

fn command(program: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

pub(crate) fn spawn_error(program: &Path, err: std::io::Error) -> ForensicError {
    error!("Failed to spawn {}: {}", program.display(), err);
    if err.kind() == std::io::ErrorKind::NotFound {
        ForensicError::Configuration(format!("{} not found", program.display()))
    } else {
        ForensicError::IoError(err)
    }
}

/// Runs `program` to completion under a hard wall-clock `timeout`.
///
/// On expiry the child is killed and [`ForensicError::Timeout`] returned; a
/// non-zero exit becomes [`ForensicError::Process`] carrying bounded stderr.
pub async fn run_tool(
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<ToolOutput, ForensicError> {
    debug!("Running {} {}", program.display(), args.join(" "));
    let child = command(program, args)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(
                "{} exceeded {:.1}s and was killed",
                program.display(),
                timeout.as_secs_f64()
            );
            return Err(ForensicError::Timeout { after: timeout });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        error!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            bounded_diagnostic(&stderr)
        );
        return Err(ForensicError::process(output.status.code(), &stderr));
    }
    trace!(
        "{} produced {} stdout byte(s)",
        program.display(),
        stdout.len()
    );
    Ok(ToolOutput { stdout, stderr })
}

/// Reads a child's stream to the end, keeping at most [`STDERR_CAPTURE_LIMIT`] bytes.
pub(crate) fn collect_bounded<R>(stream: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = stream;
        let mut kept = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = STDERR_CAPTURE_LIMIT.saturating_sub(kept.len());
                    kept.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
        String::from_utf8_lossy(&kept).into_owned()
    })
}

/// A running tool whose stdout is consumed line by line.
///
/// Dropping it before [`finish`](Self::finish) kills the process.
pub struct StreamingTool {
    program: String,
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    line: Vec<u8>,
}

impl StreamingTool {
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self, ForensicError> {
        debug!("Streaming {} {}", program.display(), args.join(" "));
        let mut child = command(program, args)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ForensicError::process(None, "child process has no stdout pipe")
        })?;
        let stderr = child.stderr.take().map(collect_bounded);
        Ok(Self {
            program: program.display().to_string(),
            child,
            stdout: BufReader::new(stdout),
            stderr,
            line: Vec::new(),
        })
    }

    /// Next stdout line without its terminator; invalid UTF-8 is replaced.
    pub async fn next_line(&mut self) -> Result<Option<String>, ForensicError> {
        self.line.clear();
        let n = self.stdout.read_until(b'\n', &mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        while matches!(self.line.last(), Some(b'\n') | Some(b'\r')) {
            self.line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&self.line).into_owned()))
    }

    /// Waits for exit and turns a non-zero status into [`ForensicError::Process`].
    pub async fn finish(mut self) -> Result<(), ForensicError> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if status.success() {
            debug!("{} finished", self.program);
            Ok(())
        } else {
            error!(
                "{} exited with {}: {}",
                self.program,
                status,
                bounded_diagnostic(&stderr)
            );
            Err(ForensicError::process(status.code(), &stderr))
        }
    }
}
