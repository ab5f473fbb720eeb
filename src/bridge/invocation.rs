//! Authoring process invocation.
//!
//! Contract with the executable:
//!
//! ```text
//! <executable> <cache_dir> <model_id> [payload]
//! env: <library_path_var>=<library_path>
//! stdin:  serialized change set (unless passed as an argument), then EOF
//! stdout: UTF-8 text, relayed to the session line by line
//! stderr: logged, not relayed
//! ```

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

use super::{BridgeConfig, Job, LineReassembler, Outcome, PayloadDelivery, SubmissionId};
use crate::constants::READ_CHUNK_SIZE;

/// How long to keep collecting stderr after the process is gone.
const STDERR_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Why stdout pumping stopped.
#[derive(Debug)]
enum StreamEnd {
    Eof,
    Failed(std::io::Error),
    TimedOut,
    Cancelled,
}

/// Build the command for one submission.
pub fn build_command(config: &BridgeConfig, payload: &str) -> Command {
    let mut command = Command::new(&config.executable);
    command.arg(&config.cache_dir).arg(&config.model_id);

    match config.payload_delivery {
        PayloadDelivery::Stdin => {
            command.stdin(Stdio::piped());
        }
        PayloadDelivery::Argument => {
            command.arg(payload);
            command.stdin(Stdio::null());
        }
    }

    if let Some(library_path) = &config.library_path {
        command.env(&config.library_path_var, library_path);
    }

    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Run one job to completion and report how it ended.
///
/// Lines are emitted on the job's event sender as they complete. The
/// caller sends the completion signal.
pub(crate) async fn run(config: &BridgeConfig, job: &Job, shutdown: &CancellationToken) -> Outcome {
    let mut child = match build_command(config, &job.payload).spawn() {
        Ok(child) => child,
        Err(e) => {
            log::error!(
                "[Bridge] Failed to spawn {} for {}: {e}",
                config.executable.display(),
                job.id
            );
            return Outcome::SpawnFailed {
                reason: e.to_string(),
            };
        }
    };

    log::info!(
        "[Bridge] Spawned {} (pid {:?}) for {}",
        config.executable.display(),
        child.id(),
        job.id
    );

    let stdin_task = child
        .stdin
        .take()
        .map(|stdin| tokio::spawn(write_payload(stdin, job.payload.clone(), job.id)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(log_stderr(stderr, job.id)));

    let Some(mut stdout) = child.stdout.take() else {
        terminate(&mut child, job.id).await;
        return Outcome::StreamFailed {
            reason: "stdout was not captured".to_string(),
        };
    };

    let deadline = tokio::time::sleep(config.timeout);
    tokio::pin!(deadline);

    let mut reassembler = LineReassembler::new();
    let end = tokio::select! {
        biased;
        () = job.cancel.cancelled() => StreamEnd::Cancelled,
        () = shutdown.cancelled() => StreamEnd::Cancelled,
        () = &mut deadline => StreamEnd::TimedOut,
        result = pump(&mut stdout, &mut reassembler, job) => match result {
            Ok(()) => StreamEnd::Eof,
            Err(e) => StreamEnd::Failed(e),
        },
    };

    let outcome = match end {
        StreamEnd::Eof => {
            if let Some(line) = reassembler.finish() {
                job.emit_line(line);
            }
            tokio::select! {
                biased;
                () = job.cancel.cancelled() => {
                    terminate(&mut child, job.id).await;
                    Outcome::Cancelled
                }
                () = shutdown.cancelled() => {
                    terminate(&mut child, job.id).await;
                    Outcome::Cancelled
                }
                () = &mut deadline => {
                    log::warn!("[Bridge] {} closed stdout but did not exit in time", job.id);
                    terminate(&mut child, job.id).await;
                    Outcome::TimedOut
                }
                status = child.wait() => match status {
                    Ok(status) => Outcome::from_exit(status),
                    Err(e) => Outcome::StreamFailed { reason: e.to_string() },
                },
            }
        }
        StreamEnd::Failed(e) => {
            log::error!("[Bridge] Read error on {} stdout: {e}", job.id);
            terminate(&mut child, job.id).await;
            Outcome::StreamFailed {
                reason: e.to_string(),
            }
        }
        StreamEnd::TimedOut => {
            log::warn!(
                "[Bridge] {} exceeded {:?}, killing",
                job.id,
                config.timeout
            );
            if let Some(line) = reassembler.fail() {
                job.emit_line(line);
            }
            terminate(&mut child, job.id).await;
            Outcome::TimedOut
        }
        StreamEnd::Cancelled => {
            log::info!("[Bridge] {} cancelled, killing", job.id);
            terminate(&mut child, job.id).await;
            Outcome::Cancelled
        }
    };

    if let Some(task) = stdin_task {
        task.abort();
    }
    if let Some(mut task) = stderr_task {
        if tokio::time::timeout(STDERR_DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }

    outcome
}

/// Read stdout until EOF, emitting each completed line.
///
/// On a read error the unterminated residue is emitted as a final partial
/// line before the error is returned.
async fn pump<R: AsyncRead + Unpin>(
    reader: &mut R,
    reassembler: &mut LineReassembler,
    job: &Job,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                if let Some(line) = reassembler.fail() {
                    job.emit_line(line);
                }
                return Err(e);
            }
        };
        if n == 0 {
            return Ok(());
        }
        for line in reassembler.feed(&buf[..n]) {
            job.emit_line(line);
        }
    }
}

/// Write the payload to stdin and close it so the process sees EOF.
async fn write_payload(mut stdin: ChildStdin, payload: String, id: SubmissionId) {
    if let Err(e) = stdin.write_all(payload.as_bytes()).await {
        // The process may exit without reading its input.
        log::debug!("[Bridge] Could not write payload to {}: {e}", id);
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        log::debug!("[Bridge] Could not close stdin of {}: {e}", id);
    }
}

/// Log stderr line by line until EOF.
async fn log_stderr<R: AsyncRead + Unpin>(mut stderr: R, id: SubmissionId) {
    let mut reassembler = LineReassembler::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in reassembler.feed(&buf[..n]) {
                    log::warn!("[Bridge] {} stderr: {}", id, line);
                }
            }
            Err(e) => {
                log::debug!("[Bridge] stderr read error on {}: {e}", id);
                if let Some(line) = reassembler.fail() {
                    log::warn!("[Bridge] {} stderr: {}", id, line);
                }
                return;
            }
        }
    }
    if let Some(line) = reassembler.finish() {
        log::warn!("[Bridge] {} stderr: {}", id, line);
    }
}

/// Kill the process and reap it.
async fn terminate(child: &mut Child, id: SubmissionId) {
    if let Err(e) = child.kill().await {
        log::warn!("[Bridge] Failed to kill process for {}: {e}", id);
    }
}
