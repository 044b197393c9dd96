//! Container logs as server-sent events.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::cluster::{ClusterConnector, LogLines, LogOptions};
use crate::session::TerminalResult;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_EVENT: &str = "PING";
pub const RECONNECT_EVENT: &str = "RECONNECT_STREAM";
pub const ERROR_EVENT: &str = "CUSTOM_ERR_STREAM";

const FRAME_BUFFER: usize = 64;

/// Query of `GET /k8s/pods/logs/{podName}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub cluster_id: i64,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub follow: bool,
    #[serde(default)]
    pub tail_lines: Option<i64>,
    #[serde(default)]
    pub since_seconds: Option<i64>,
    #[serde(default)]
    pub since_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous: bool,
}

/// One frame of a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFrame {
    /// A log line; `id` is its timestamp in nanoseconds.
    Line { id: i64, data: String },
    Ping,
    Reconnect,
    Error(String),
}

#[derive(Debug, Serialize)]
struct StreamError<'a> {
    code: u16,
    message: &'a str,
}

impl LogFrame {
    pub fn into_event(self) -> Event {
        match self {
            LogFrame::Line { id, data } => Event::default().id(id.to_string()).data(data),
            LogFrame::Ping => Event::default().event(PING_EVENT).data(PING_EVENT),
            LogFrame::Reconnect => Event::default().event(RECONNECT_EVENT).data(RECONNECT_EVENT),
            LogFrame::Error(message) => {
                let body = serde_json::to_string(&StreamError {
                    code: 500,
                    message: &message,
                })
                .unwrap_or_else(|_| "{}".to_string());
                Event::default().event(ERROR_EVENT).data(body)
            }
        }
    }
}

/// Split a `--timestamps` log line into its nanosecond timestamp and text.
pub fn split_timestamp(line: &str) -> (Option<i64>, &str) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((ts, text)) => match DateTime::parse_from_rfc3339(ts) {
            Ok(at) => (at.timestamp_nanos_opt(), text),
            Err(_) => (None, line),
        },
        None => match DateTime::parse_from_rfc3339(line) {
            Ok(at) => (at.timestamp_nanos_opt(), ""),
            Err(_) => (None, line),
        },
    }
}

/// Parse a `Last-Event-ID` header.
pub fn parse_last_event_id(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse::<i64>().ok())
}

/// Log frames backed by producer and heartbeat tasks. Dropping it stops both.
pub struct LogStream {
    frames: ReceiverStream<LogFrame>,
    _stop: DropGuard,
}

impl Stream for LogStream {
    type Item = LogFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogFrame>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

pub struct LogStreamer {
    connector: Arc<dyn ClusterConnector>,
    heartbeat: Duration,
}

impl LogStreamer {
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Self {
        Self::with_heartbeat(connector, HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat(connector: Arc<dyn ClusterConnector>, heartbeat: Duration) -> Self {
        Self { connector, heartbeat }
    }

    /// Open the logs of `pod`. When `last_event_id` is set the stream resumes right after
    /// that line and starts with a reconnect frame.
    pub async fn open(
        &self,
        pod: &str,
        query: &LogQuery,
        last_event_id: Option<i64>,
    ) -> TerminalResult<LogStream> {
        let cluster = self.connector.connect(query.cluster_id).await?;

        let mut options = LogOptions {
            container: query.container_name.clone().filter(|c| !c.is_empty()),
            follow: query.follow,
            tail_lines: query.tail_lines,
            since_seconds: query.since_seconds,
            since_time: query.since_time,
            previous: query.previous,
        };
        if let Some(last) = last_event_id {
            options.since_time = Some(DateTime::from_timestamp_nanos(last.saturating_add(1)));
            options.since_seconds = None;
            options.tail_lines = None;
        }

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let stop = CancellationToken::new();

        if last_event_id.is_some() {
            let _ = tx.send(LogFrame::Reconnect).await;
        }

        match cluster.pod_logs(&query.namespace, pod, &options).await {
            Ok(lines) => {
                tokio::spawn(produce(lines, tx.clone(), last_event_id, stop.clone()));
                tokio::spawn(heartbeat(tx, self.heartbeat, stop.clone()));
            }
            Err(e) => {
                warn!("opening logs of {}/{} failed: {}", query.namespace, pod, e);
                let _ = tx.send(LogFrame::Error(e.to_string())).await;
            }
        }

        Ok(LogStream {
            frames: ReceiverStream::new(rx),
            _stop: stop.drop_guard(),
        })
    }
}

async fn produce(
    mut lines: LogLines,
    tx: mpsc::Sender<LogFrame>,
    after: Option<i64>,
    stop: CancellationToken,
) {
    let mut last_id = after.unwrap_or(i64::MIN);
    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => break,
            next = lines.next() => next,
        };
        let frame = match next {
            None => break,
            Some(Err(e)) => {
                let _ = tx.send(LogFrame::Error(e.to_string())).await;
                break;
            }
            Some(Ok(line)) => {
                let (ts, text) = split_timestamp(&line);
                match ts {
                    // Resumed streams restart at second precision; skip what was delivered.
                    Some(ts) if after.is_some_and(|a| ts <= a) => continue,
                    _ => {}
                }
                let id = ts.unwrap_or_else(|| Utc::now().timestamp_nanos_opt().unwrap_or(0));
                let id = id.max(last_id.saturating_add(1));
                last_id = id;
                LogFrame::Line {
                    id,
                    data: text.replace('\r', ""),
                }
            }
        };
        if tx.send(frame).await.is_err() {
            break;
        }
    }
    debug!("log producer finished");
    stop.cancel();
}

async fn heartbeat(tx: mpsc::Sender<LogFrame>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if tx.send(LogFrame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cluster::testing::{FakeCluster, FakeConnector};

    const T1: &str = "2025-03-01T10:00:00.000000001Z";
    const T2: &str = "2025-03-01T10:00:00.500000000Z";
    const T3: &str = "2025-03-01T10:00:01.000000000Z";

    fn streamer(heartbeat: Duration) -> (LogStreamer, Arc<FakeCluster>) {
        let cluster = FakeCluster::new();
        cluster.insert_pod("default", "web-0", "Running");
        *cluster.log_lines.lock().unwrap() = vec![
            format!("{T1} starting"),
            format!("{T2} listening on :8080"),
            format!("{T3} ready\r"),
        ];
        let connector = FakeConnector::with_cluster(1, Arc::clone(&cluster));
        (LogStreamer::with_heartbeat(connector, heartbeat), cluster)
    }

    fn query() -> LogQuery {
        LogQuery {
            cluster_id: 1,
            namespace: "default".to_string(),
            ..Default::default()
        }
    }

    fn nanos(ts: &str) -> i64 {
        DateTime::parse_from_rfc3339(ts)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
    }

    #[test]
    fn timestamps_are_split_off() {
        let line = format!("{T1} hello world");
        let (ts, text) = split_timestamp(&line);
        assert_eq!(ts, Some(nanos(T1)));
        assert_eq!(text, "hello world");
        assert_eq!(split_timestamp("no timestamp here"), (None, "no timestamp here"));
        assert_eq!(parse_last_event_id(Some(" 42 ")), Some(42));
        assert_eq!(parse_last_event_id(Some("abc")), None);
    }

    #[tokio::test]
    async fn lines_carry_nanosecond_ids() {
        let (streamer, _) = streamer(HEARTBEAT_INTERVAL);
        let frames: Vec<LogFrame> = streamer.open("web-0", &query(), None).await.unwrap().collect().await;
        assert_eq!(
            frames,
            vec![
                LogFrame::Line { id: nanos(T1), data: "starting".to_string() },
                LogFrame::Line { id: nanos(T2), data: "listening on :8080".to_string() },
                LogFrame::Line { id: nanos(T3), data: "ready".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn reconnect_resumes_after_the_last_id() {
        let (streamer, _) = streamer(HEARTBEAT_INTERVAL);
        let frames: Vec<LogFrame> = streamer
            .open("web-0", &query(), Some(nanos(T1)))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(frames[0], LogFrame::Reconnect);
        let ids: Vec<i64> = frames[1..]
            .iter()
            .map(|f| match f {
                LogFrame::Line { id, .. } => *id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![nanos(T2), nanos(T3)]);
    }

    #[tokio::test]
    async fn equal_timestamps_still_get_distinct_ids() {
        let (streamer, cluster) = streamer(HEARTBEAT_INTERVAL);
        *cluster.log_lines.lock().unwrap() = vec![format!("{T1} a"), format!("{T1} b"), "c".to_string()];
        let frames: Vec<LogFrame> = streamer.open("web-0", &query(), None).await.unwrap().collect().await;
        let mut ids: Vec<i64> = frames
            .iter()
            .filter_map(|f| match f {
                LogFrame::Line { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 3);
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn failures_become_an_error_frame() {
        let (streamer, _) = streamer(HEARTBEAT_INTERVAL);
        let frames: Vec<LogFrame> = streamer.open("web-9", &query(), None).await.unwrap().collect().await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], LogFrame::Error(m) if m.contains("not found")));

        let (streamer, cluster) = self::streamer(HEARTBEAT_INTERVAL);
        cluster.unreachable.store(true, Ordering::SeqCst);
        let frames: Vec<LogFrame> = streamer.open("web-0", &query(), None).await.unwrap().collect().await;
        assert!(matches!(&frames[0], LogFrame::Error(m) if m.contains("unreachable")));

        let unknown = LogQuery { cluster_id: 7, ..query() };
        assert!(streamer.open("web-0", &unknown, None).await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_pings_until_stopped() {
        let (tx, mut rx) = mpsc::channel(8);
        let stop = CancellationToken::new();
        let task = tokio::spawn(heartbeat(tx, Duration::from_millis(10), stop.clone()));

        assert_eq!(rx.recv().await, Some(LogFrame::Ping));
        assert_eq!(rx.recv().await, Some(LogFrame::Ping));
        stop.cancel();
        task.await.unwrap();
        while let Some(frame) = rx.recv().await {
            assert_eq!(frame, LogFrame::Ping);
        }
    }

    #[test]
    fn errors_are_json_events() {
        let frame = LogFrame::Error("boom".to_string());
        let LogFrame::Error(message) = &frame else { unreachable!() };
        let body = serde_json::to_value(StreamError { code: 500, message }).unwrap();
        assert_eq!(body["message"], "boom");
        let _ = frame.into_event();
    }
}
