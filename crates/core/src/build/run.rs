use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives each captured output line as soon as it is read; the live
/// stream exists purely for UX and parsing happens on the full capture.
pub type OutputSink = mpsc::UnboundedSender<String>;

/// Spawn a build command with piped stdout+stderr, forward every line to
/// the sink as it arrives, and return the full interleaved capture plus
/// the exit code. Does not impose a timeout; callers bound the process
/// lifetime themselves.
pub async fn run_streaming(
    program: impl AsRef<Path>,
    args: &[&str],
    cwd: &Path,
    sink: Option<OutputSink>,
) -> Result<(String, i32)> {
    let program = program.as_ref();
    debug!(program = %program.display(), ?args, cwd = %cwd.display(), "Spawning build process");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program.display()))?;

    let stdout = child
        .stdout
        .take()
        .context("child stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("child stderr was not captured")?;

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let mut captured = String::new();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !stdout_done || !stderr_done {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(line)) => forward(&mut captured, &sink, line),
                    _ => stdout_done = true,
                }
            }
            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(line)) => forward(&mut captured, &sink, line),
                    _ => stderr_done = true,
                }
            }
        }
    }

    let status = child.wait().await.context("waiting on build process")?;
    let exit_code = status.code().unwrap_or(-1);
    Ok((captured, exit_code))
}

fn forward(captured: &mut String, sink: &Option<OutputSink>, line: String) {
    if let Some(sink) = sink {
        let _ = sink.send(line.clone());
    }
    if !captured.is_empty() {
        captured.push('\n');
    }
    captured.push_str(&line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_and_streams_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (output, code) =
            run_streaming("sh", &["-c", "echo one; echo two >&2"], dir.path(), Some(tx))
                .await
                .unwrap();
        assert_eq!(code, 0);
        assert!(output.contains("one"));
        assert!(output.contains("two"));

        let mut streamed = Vec::new();
        while let Ok(line) = rx.try_recv() {
            streamed.push(line);
        }
        assert_eq!(streamed.len(), 2);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (_, code) = run_streaming("sh", &["-c", "exit 3"], dir.path(), None)
            .await
            .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn missing_binary_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            run_streaming("definitely-not-a-real-binary", &[], dir.path(), None)
                .await
                .is_err()
        );
    }
}
