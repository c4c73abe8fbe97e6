//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::CancelToken;

/// How often a running child is checked against the cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because the cancellation token tripped.
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        truncated_notice(label, "stderr", self.stderr_truncated)
    }
}

fn truncated_notice(label: &str, stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{label} {stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

type StreamFile = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// If `stream_path` is `Some`, each stdout line is also written there as it arrives.
/// The child runs in its own process group; the whole group is killed when `timeout` elapses or
/// `cancel` trips, so grandchildren holding the output pipes cannot outlive the bound.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, streaming = stream_path.is_some()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
    stream_path: Option<&Path>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.process_group(0);

    let stream_file: StreamFile = match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Arc::new(Some(Mutex::new(BufWriter::new(file))))
        }
        None => Arc::new(None),
    };

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle =
        thread::spawn(move || read_stream_limited_with_tee(stdout, output_limit_bytes, stream_file));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Fed from its own thread so a child that never reads cannot block the timeout.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    warn!(err = %e, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let deadline = started + timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let now = Instant::now();
        let slice = deadline.saturating_duration_since(now).min(CANCEL_POLL_INTERVAL);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            warn!("cancellation requested, killing command");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
        } else {
            continue;
        }
        kill_process_group(&mut child)?;
        break child.wait().context("wait command after kill")?;
    };
    let duration = started.elapsed();
    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        duration,
    })
}

fn kill_process_group(child: &mut Child) -> Result<()> {
    let pgid = i32::try_from(child.id()).context("child pid out of range")?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(err = %err, pgid, "killpg failed, killing child only");
            child.kill().context("kill command")
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, tee-ing to the stream file if present.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    stream_file: StreamFile,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_status() {
        let out = run_command(
            sh("cat; echo err >&2; exit 3"),
            Some(b"hello"),
            Duration::from_secs(10),
            1024,
            &CancelToken::new(),
            None,
        )
        .expect("run");
        assert_eq!(out.stdout_lossy(), "hello");
        assert_eq!(out.stderr_lossy(), "err\n");
        assert_eq!(out.status.code(), Some(3));
        assert!(!out.status.success());
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let out = run_command(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
            &CancelToken::new(),
            None,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_truncated_notice("agent").contains("truncated 6 bytes"));
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command(
            sh("sleep 5"),
            None,
            Duration::from_millis(300),
            1024,
            &CancelToken::new(),
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let started = Instant::now();
        let out = run_command(
            sh("sleep 4; true"),
            None,
            Duration::from_millis(300),
            1024,
            &CancelToken::new(),
            None,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[test]
    fn cancel_kills_background_jobs() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let started = Instant::now();
        let out = run_command(
            sh("sleep 4 & wait"),
            None,
            Duration::from_secs(30),
            1024,
            &cancel,
            None,
        )
        .expect("run");
        assert!(out.cancelled);
        assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    }

    #[test]
    fn kills_on_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = run_command(
            sh("sleep 5"),
            None,
            Duration::from_secs(30),
            1024,
            &cancel,
            None,
        )
        .expect("run");
        assert!(out.cancelled);
        assert!(!out.timed_out);
    }

    #[test]
    fn streams_stdout_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs/out.txt");
        run_command(
            sh("echo one; echo two"),
            None,
            Duration::from_secs(10),
            1024,
            &CancelToken::new(),
            Some(&stream),
        )
        .expect("run");
        assert_eq!(std::fs::read_to_string(stream).expect("read"), "one\ntwo\n");
    }
}
