//! Shell negotiation and byte pumping between a bound channel and a remote process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::channel::{FrameSink, FrameSource, TerminalChannel};
use super::hub::ExecTarget;
use super::message::{Op, TerminalMessage};
use super::shell::shell_order;
use super::ActivityClock;
use crate::cluster::{
    ClusterApi, ClusterResult, ExecExit, ExecProtocol, ExecRequest, ExecStream, TerminalSize,
    exec_with_fallback,
};

/// The remote process ended or the session was closed.
pub const CLOSE_PROCESS_EXITED: u16 = 4001;
/// No shell could be started, or the process failed.
pub const CLOSE_START_FAILED: u16 = 4002;
/// The first frame was not a bind frame.
pub const CLOSE_BAD_BIND: u16 = 4400;
/// The bind frame named an unknown or expired session.
pub const CLOSE_UNKNOWN_SESSION: u16 = 4410;

const END_OF_TRANSMISSION: &[u8] = b"\x04";
const INPUT_QUEUE: usize = 64;
const READ_BUFFER: usize = 8192;
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

type SharedSink = Arc<Mutex<Box<dyn FrameSink>>>;

enum Input {
    Stdin(Vec<u8>),
    Resize(TerminalSize),
    /// End of input; `hangup` means the browser is gone.
    Eof { hangup: bool },
}

enum Attempt {
    Finished { exit: ExecExit, produced: bool },
    Hangup,
    Cancelled,
}

/// Open an exec stream for a channel. While `protocol` is unset the call may fall back to the
/// legacy transport when the modern upgrade is refused; the first call fixes the protocol and
/// later calls never retry.
pub async fn open_exec(
    cluster: &dyn ClusterApi,
    request: &ExecRequest,
    protocol: &mut Option<ExecProtocol>,
) -> ClusterResult<ExecStream> {
    if let Some(fixed) = *protocol {
        return cluster.exec(request, fixed).await;
    }
    let (used, stream) = exec_with_fallback(cluster, request).await;
    *protocol = Some(used);
    stream
}

pub(super) async fn run(target: ExecTarget, channel: TerminalChannel, cancel: CancellationToken) {
    let TerminalChannel { source, sink } = channel;
    let sink: SharedSink = Arc::new(Mutex::new(sink));
    let (input_tx, mut input_rx) = mpsc::channel(INPUT_QUEUE);
    let reader = tokio::spawn(read_frames(source, input_tx));

    let outcome = negotiate(&target, &mut input_rx, &sink, &cancel).await;
    reader.abort();

    let mut sink = sink.lock().await;
    let closed = match outcome {
        Ok(()) => sink.close(CLOSE_PROCESS_EXITED, "Process exited").await,
        Err(message) => {
            warn!(
                "terminal {}/{} failed: {}",
                target.namespace, target.pod, message
            );
            let _ = sink.send(TerminalMessage::toast(message.clone())).await;
            sink.close(CLOSE_START_FAILED, &message).await
        }
    };
    if let Err(e) = closed {
        debug!("closing terminal channel: {}", e);
    }
}

async fn read_frames(mut source: Box<dyn FrameSource>, input: mpsc::Sender<Input>) {
    loop {
        let next = match source.recv().await {
            Some(Ok(msg)) => match msg.op {
                Op::Stdin => Input::Stdin(msg.data.into_bytes()),
                Op::Resize => Input::Resize(TerminalSize {
                    width: msg.cols,
                    height: msg.rows,
                }),
                _ => {
                    debug!("unexpected {:?} frame, closing remote stdin", msg.op);
                    let _ = input.send(Input::Eof { hangup: false }).await;
                    return;
                }
            },
            Some(Err(e)) => {
                debug!("terminal channel read failed: {}", e);
                let _ = input.send(Input::Eof { hangup: true }).await;
                return;
            }
            None => {
                let _ = input.send(Input::Eof { hangup: true }).await;
                return;
            }
        };
        if input.send(next).await.is_err() {
            return;
        }
    }
}

async fn negotiate(
    target: &ExecTarget,
    input: &mut mpsc::Receiver<Input>,
    sink: &SharedSink,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let mut protocol = None;
    let mut last_error = super::shell::NO_SHELL_SUPPORTED.to_string();

    for shell in shell_order(&target.shell) {
        let request = ExecRequest::interactive(
            &target.namespace,
            &target.pod,
            target.container.as_deref(),
            vec![shell.to_string()],
        );
        let stream = match open_exec(target.cluster.as_ref(), &request, &mut protocol).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("starting {} in {}/{} failed: {}", shell, target.namespace, target.pod, e);
                last_error = e.to_string();
                continue;
            }
        };
        info!(
            "terminal attached to {}/{} with {} ({:?})",
            target.namespace,
            target.pod,
            shell,
            protocol.unwrap_or(ExecProtocol::Modern)
        );

        match attempt(stream, input, sink, target.activity.as_ref(), cancel).await {
            Attempt::Finished { exit, produced } if !exit.success && !produced => {
                last_error = exit
                    .message
                    .unwrap_or_else(|| format!("{shell} exited immediately"));
            }
            Attempt::Finished { exit, .. } => {
                return match exit.message {
                    Some(message) if !exit.success => Err(message),
                    _ => Ok(()),
                };
            }
            Attempt::Hangup | Attempt::Cancelled => return Ok(()),
        }
    }
    Err(last_error)
}

async fn attempt(
    stream: ExecStream,
    input: &mut mpsc::Receiver<Input>,
    sink: &SharedSink,
    activity: Option<&Arc<ActivityClock>>,
    cancel: &CancellationToken,
) -> Attempt {
    let ExecStream {
        mut stdin,
        stdout,
        stderr,
        resize,
        mut exit,
    } = stream;

    let produced = Arc::new(AtomicBool::new(false));
    let output = stdout.map(|reader| {
        tokio::spawn(forward_output(
            reader,
            Arc::clone(sink),
            activity.cloned(),
            Arc::clone(&produced),
        ))
    });
    if let Some(mut stderr) = stderr {
        tokio::spawn(async move {
            let mut discarded = Vec::new();
            let _ = stderr.read_to_end(&mut discarded).await;
        });
    }

    let mut input_open = true;
    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Attempt::Cancelled,
            done = &mut exit => break Attempt::Finished { exit: done, produced: false },
            next = input.recv(), if input_open => match next {
                Some(Input::Stdin(bytes)) => {
                    if let Some(writer) = stdin.as_mut() {
                        if writer.write_all(&bytes).await.is_err() || writer.flush().await.is_err() {
                            debug!("remote stdin closed");
                        }
                    }
                    if let Some(activity) = activity {
                        activity.touch();
                    }
                }
                Some(Input::Resize(size)) => {
                    if let Some(queue) = &resize {
                        let _ = queue.send(size).await;
                    }
                }
                Some(Input::Eof { hangup }) => {
                    if let Some(writer) = stdin.as_mut() {
                        let _ = writer.write_all(END_OF_TRANSMISSION).await;
                        let _ = writer.flush().await;
                    }
                    input_open = false;
                    if hangup {
                        break Attempt::Hangup;
                    }
                }
                None => input_open = false,
            },
        }
    };
    drop(stdin);
    drop(resize);

    match (result, output) {
        (Attempt::Finished { exit, .. }, Some(task)) => {
            if tokio::time::timeout(OUTPUT_DRAIN, task).await.is_err() {
                debug!("output still streaming after exit");
            }
            Attempt::Finished {
                exit,
                produced: produced.load(Ordering::SeqCst),
            }
        }
        (other, task) => {
            if let Some(task) = task {
                task.abort();
            }
            other
        }
    }
}

async fn forward_output(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    sink: SharedSink,
    activity: Option<Arc<ActivityClock>>,
    produced: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        produced.store(true, Ordering::SeqCst);
        if let Some(activity) = &activity {
            activity.touch();
        }

        pending.extend_from_slice(&buf[..n]);
        let text = take_utf8(&mut pending);
        if text.is_empty() {
            continue;
        }
        if sink.lock().await.send(TerminalMessage::stdout(text)).await.is_err() {
            break;
        }
    }
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        let _ = sink.lock().await.send(TerminalMessage::stdout(text)).await;
    }
}

/// Split off the longest valid UTF-8 prefix, keeping an incomplete trailing sequence in
/// `pending` for the next read. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(text) => {
            let text = text.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
