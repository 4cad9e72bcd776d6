// ABOUTME: Launches service child processes in their own session.
// ABOUTME: Forwards stdout/stderr lines into the per-process log buffer.

use super::logs::LogBuffer;
use super::{lock, SpawnRequest};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Start the child. Returns as soon as the OS has accepted the launch.
pub(super) fn launch(request: &SpawnRequest) -> std::io::Result<Child> {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.cwd)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    // New session: the child must not share our controlling terminal, so it
    // keeps running if the supervisor is interrupted or crashes.
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }

    cmd.spawn()
}

/// Spawn tasks that copy the child's output into `log` line by line
pub(super) fn capture_output(child: &mut Child, id: &str, log: Arc<Mutex<LogBuffer>>) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, id.to_string(), log.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, id.to_string(), log));
    }
}

async fn forward_lines<R>(stream: R, id: String, log: Arc<Mutex<LogBuffer>>)
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
                // Lossy so a stray non-UTF-8 byte does not end capture
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                tracing::trace!(id = %id, line = %line, "process output");
                lock(&log).push(line);
            }
            Err(e) => {
                tracing::debug!(id = %id, error = %e, "Stopped reading process output");
                break;
            }
        }
    }
}
