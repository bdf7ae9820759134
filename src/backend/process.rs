// Child-process plumbing shared by the ssh and local backends: capture, streaming, interactive pumping.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use super::{InteractiveSession, OutputSink, SessionDelegate, TerminationCheck};

/// How often `should_terminate` is polled while a script is silent.
const TERMINATION_POLL: Duration = Duration::from_millis(250);

/// Captured result of a short command.
#[derive(Debug)]
pub(super) struct Captured {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// How a streamed run ended.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum StreamOutcome {
    Exited(Option<i32>),
    Terminated,
}

/// Run to completion with an optional stdin payload; the child is killed on timeout.
pub(super) async fn run_capture(
    mut cmd: Command,
    stdin_payload: Option<Vec<u8>>,
    timeout: Duration,
) -> anyhow::Result<Captured> {
    cmd.stdin(if stdin_payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    let mut child = cmd.spawn().context("failed to spawn process")?;

    let stdin_task = feed_stdin(child.stdin.take(), stdin_payload);
    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    tokio::select! {
        result = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                read_all(&mut stdout_handle),
                read_all(&mut stderr_handle),
            );
            let _ = stdin_task.await;
            Ok(Captured {
                code: status.context("waiting for process")?.code(),
                stdout,
                stderr,
            })
        } => result,
        () = tokio::time::sleep(timeout) => {
            let _ = child.kill().await;
            anyhow::bail!("process timed out after {}s", timeout.as_secs())
        }
    }
}

/// Run a script, forwarding stdout and stderr line by line to `on_output`.
/// `should_terminate` is checked between chunks and on a short tick; `true` kills the child.
pub(super) async fn run_streaming(
    mut cmd: Command,
    stdin_payload: Option<Vec<u8>>,
    on_output: OutputSink,
    should_terminate: TerminationCheck,
) -> anyhow::Result<StreamOutcome> {
    cmd.stdin(if stdin_payload.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);
    let mut child = cmd.spawn().context("failed to spawn process")?;

    let stdin_task = feed_stdin(child.stdin.take(), stdin_payload);
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
    if let Some(out) = child.stdout.take() {
        tokio::spawn(forward_lines(out, chunk_tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(forward_lines(err, chunk_tx.clone()));
    }
    drop(chunk_tx);

    let mut poll = tokio::time::interval(TERMINATION_POLL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            chunk = chunk_rx.recv() => match chunk {
                Some(chunk) => {
                    if should_terminate() {
                        let _ = child.kill().await;
                        return Ok(StreamOutcome::Terminated);
                    }
                    on_output(&chunk);
                }
                None => break,
            },
            _ = poll.tick() => {
                if should_terminate() {
                    let _ = child.kill().await;
                    return Ok(StreamOutcome::Terminated);
                }
            }
        }
    }

    let status = child.wait().await.context("waiting for process")?;
    let _ = stdin_task.await;
    Ok(StreamOutcome::Exited(status.code()))
}

/// Spawn an interactive child and pump its I/O between the session handle and `delegate`.
pub(super) fn spawn_interactive(
    mut cmd: Command,
    delegate: Arc<dyn SessionDelegate>,
) -> anyhow::Result<InteractiveSession> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().context("failed to spawn interactive process")?;

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(32);
    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    for reader in [
        stdout.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
        stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
    ]
    .into_iter()
    .flatten()
    {
        let delegate = delegate.clone();
        tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => delegate.on_output(&buf[..n]),
                }
            }
        });
    }

    let task = tokio::spawn(async move {
        let mut input_open = true;
        let code = loop {
            tokio::select! {
                data = input_rx.recv(), if input_open => match data {
                    Some(data) => {
                        if let Some(stdin) = stdin.as_mut()
                            && stdin.write_all(&data).await.is_err()
                        {
                            tracing::debug!("interactive stdin closed");
                        }
                    }
                    None => {
                        // Handle dropped its sender; close stdin and let the child finish.
                        input_open = false;
                        stdin.take();
                    }
                },
                _ = &mut close_rx => {
                    let _ = child.kill().await;
                    break child.wait().await.ok().and_then(|s| s.code());
                }
                status = child.wait() => {
                    break status.ok().and_then(|s| s.code());
                }
            }
        };
        delegate.on_closed(code);
    });

    Ok(InteractiveSession {
        input: input_tx,
        close_tx: Some(close_tx),
        task: Some(task),
    })
}

fn feed_stdin(
    stdin: Option<tokio::process::ChildStdin>,
    payload: Option<Vec<u8>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let (Some(mut stdin), Some(payload)) = (stdin, payload) {
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(error = %e, "writing process stdin failed");
            }
            let _ = stdin.shutdown().await;
        }
    })
}

async fn read_all<R: AsyncRead + Unpin>(handle: &mut Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(h) = handle.as_mut() {
        let _ = h.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&line).into_owned()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn capture_collects_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello; echo oops >&2; exit 3");
        let out = run_capture(cmd, None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn capture_feeds_stdin() {
        let mut cmd = Command::new("sh");
        cmd.arg("-s");
        let out = run_capture(cmd, Some(b"echo from-stdin\n".to_vec()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "from-stdin");
    }

    #[tokio::test]
    async fn streaming_forwards_chunks() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink_seen = seen.clone();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo one; echo two");
        let outcome = run_streaming(
            cmd,
            None,
            Arc::new(move |c: &str| sink_seen.lock().unwrap().push_str(c)),
            Arc::new(|| false),
        )
        .await
        .unwrap();
        assert_eq!(outcome, StreamOutcome::Exited(Some(0)));
        assert_eq!(&*seen.lock().unwrap(), "one\ntwo\n");
    }

    #[tokio::test]
    async fn streaming_terminates_silent_script() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let started = std::time::Instant::now();
        let outcome = run_streaming(cmd, None, Arc::new(|_: &str| {}), Arc::new(|| true))
            .await
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Terminated);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
