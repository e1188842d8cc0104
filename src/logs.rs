use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ecs::{ControlPlane, cancellable};
use crate::error::EcsError;
use crate::model::{LogQuery, LogRecord, select_container};

pub const SUPPORTED_LOG_DRIVER: &str = "awslogs";
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_SINCE: Duration = Duration::from_secs(10 * 60);

/// Waits between empty polls in following mode.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, interval: Duration);
}

pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

#[derive(Debug, Clone)]
pub struct LogRequest {
    pub task: String,
    pub container: Option<String>,
    pub since: Duration,
    pub follow: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogDestination {
    pub container: String,
    pub group: String,
    pub stream: String,
}

pub async fn resolve_destination<A>(
    api: &A,
    task: &str,
    container: Option<&str>,
    cancel: &CancellationToken,
) -> Result<LogDestination, EcsError>
where
    A: ControlPlane + ?Sized,
{
    let configs = cancellable(
        cancel,
        "describe task log configuration",
        api.describe_task_log_config(task),
    )
    .await?;
    let names = configs
        .iter()
        .map(|config| config.container.clone())
        .collect::<Vec<_>>();
    let chosen = select_container(task, &names, container)?;
    let Some(config) = configs.into_iter().find(|config| config.container == chosen) else {
        return Err(EcsError::not_found("container", format!("{task}/{chosen}")));
    };

    if config.driver != SUPPORTED_LOG_DRIVER {
        return Err(EcsError::UnsupportedLogDriver {
            container: chosen,
            driver: config.driver,
        });
    }
    let Some(group) = config.group.filter(|group| !group.is_empty()) else {
        return Err(EcsError::Validation(format!(
            "container {chosen} has no awslogs-group option"
        )));
    };
    let Some(prefix) = config.stream_prefix else {
        return Err(EcsError::Validation(format!(
            "container {chosen} has no awslogs-stream-prefix option; its stream name cannot be derived"
        )));
    };

    Ok(LogDestination {
        stream: format!("{prefix}/{chosen}/{task}"),
        container: chosen,
        group,
    })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TailState {
    Fetching,
    Waiting,
    Finished,
}

type Delivery = Result<LogRecord, EcsError>;

struct LogTail<A: ?Sized, P> {
    api: Arc<A>,
    pacer: P,
    destination: LogDestination,
    start_time_millis: i64,
    follow: bool,
    page_token: Option<String>,
    last_delivered_millis: Option<i64>,
    state: TailState,
}

impl<A, P> LogTail<A, P>
where
    A: ControlPlane + ?Sized,
    P: Pacer,
{
    async fn run(mut self, tx: mpsc::UnboundedSender<Delivery>, cancel: CancellationToken) {
        while self.state != TailState::Finished {
            self.state = match self.state {
                TailState::Fetching => self.fetch(&tx, &cancel).await,
                TailState::Waiting => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => TailState::Finished,
                        _ = self.pacer.pause(FOLLOW_POLL_INTERVAL) => TailState::Fetching,
                    }
                }
                TailState::Finished => TailState::Finished,
            };
        }
        debug!(stream = %self.destination.stream, "log tail finished");
    }

    async fn fetch(
        &mut self,
        tx: &mpsc::UnboundedSender<Delivery>,
        cancel: &CancellationToken,
    ) -> TailState {
        let query = LogQuery {
            group: self.destination.group.clone(),
            stream: self.destination.stream.clone(),
            start_time_millis: self.start_time_millis,
            page_token: self.page_token.clone(),
        };
        let page = match cancellable(cancel, "fetch log records", self.api.fetch_log_records(&query))
            .await
        {
            Ok(page) => page,
            Err(EcsError::Cancelled { .. }) => return TailState::Finished,
            Err(error) => {
                warn!(stream = %self.destination.stream, "log fetch failed: {error}");
                let _ = tx.send(Err(error));
                return TailState::Finished;
            }
        };

        let mut records = page.records;
        let empty = records.is_empty();
        records.sort_by_key(|record| record.timestamp_millis);
        let received = records.len();
        // Delivery never goes back in time across pages.
        if let Some(floor) = self.last_delivered_millis {
            records.retain(|record| record.timestamp_millis >= floor);
        }
        debug!(
            stream = %self.destination.stream,
            records = records.len(),
            skipped = received - records.len(),
            last = page.is_last_page,
            "fetched log page"
        );
        for record in records {
            let timestamp_millis = record.timestamp_millis;
            if tx.send(Ok(record)).is_err() {
                debug!("log consumer went away");
                return TailState::Finished;
            }
            self.last_delivered_millis = Some(timestamp_millis);
        }
        if page.next_token.is_some() {
            self.page_token = page.next_token;
        }

        if !self.follow {
            if page.is_last_page {
                TailState::Finished
            } else {
                TailState::Fetching
            }
        } else if cancel.is_cancelled() {
            TailState::Finished
        } else if empty {
            TailState::Waiting
        } else {
            TailState::Fetching
        }
    }
}

/// Lazily consumed log records. Dropping the stream stops its poller.
pub struct LogStream {
    destination: LogDestination,
    rx: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
}

impl LogStream {
    pub fn destination(&self) -> &LogDestination {
        &self.destination
    }

    pub async fn next_record(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for LogStream {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn open_log_stream<A, P>(
    api: Arc<A>,
    pacer: P,
    request: &LogRequest,
    cancel: &CancellationToken,
) -> Result<LogStream, EcsError>
where
    A: ControlPlane + ?Sized + 'static,
    P: Pacer + 'static,
{
    let destination =
        resolve_destination(api.as_ref(), &request.task, request.container.as_deref(), cancel)
            .await?;
    let since_millis = i64::try_from(request.since.as_millis()).unwrap_or(i64::MAX);
    let start_time_millis = Utc::now().timestamp_millis().saturating_sub(since_millis).max(0);
    debug!(
        group = %destination.group,
        stream = %destination.stream,
        start_time_millis,
        follow = request.follow,
        "opening log stream"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = cancel.child_token();
    let tail = LogTail {
        api,
        pacer,
        destination: destination.clone(),
        start_time_millis,
        follow: request.follow,
        page_token: None,
        last_delivered_millis: None,
        state: TailState::Fetching,
    };
    tokio::spawn(tail.run(tx, cancel.clone()));

    Ok(LogStream {
        destination,
        rx,
        cancel,
    })
}
