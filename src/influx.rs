use crate::config::{InfluxConfig, WriteConfig};
use crate::error::{AppError, IngestError};
use crate::ingest::PointSink;
use crate::point::Point;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Where batches of line protocol end up.
pub trait LineWriter: Send + Sync + 'static {
    fn write_lines(&self, body: String) -> impl Future<Output = Result<(), AppError>> + Send;
}

#[derive(Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    token: String,
}

impl InfluxClient {
    pub fn new(cfg: &InfluxConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            write_url: format!("{}/api/v2/write", cfg.url.trim_end_matches('/')),
            org: cfg.org.clone(),
            bucket: cfg.bucket.clone(),
            token: cfg.token.clone().unwrap_or_default(),
        })
    }

    fn write_request(&self, body: String) -> reqwest::RequestBuilder {
        let req = self
            .http
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if self.token.is_empty() {
            req
        } else {
            req.header(reqwest::header::AUTHORIZATION, format!("Token {}", self.token))
        }
    }
}

impl LineWriter for InfluxClient {
    async fn write_lines(&self, body: String) -> Result<(), AppError> {
        let resp = self.write_request(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(AppError::InfluxStatus {
            status: status.as_u16(),
            body,
        })
    }
}

/// Cloneable handle that queues points for the writer task.
#[derive(Clone)]
pub struct InfluxSink {
    tx: mpsc::Sender<Point>,
}

impl PointSink for InfluxSink {
    fn submit(&self, point: Point) -> Result<(), IngestError> {
        self.tx.try_send(point).map_err(|e| match e {
            TrySendError::Full(_) => IngestError::SubmitFailed("write buffer is full".into()),
            TrySendError::Closed(_) => IngestError::SubmitFailed("writer has stopped".into()),
        })
    }
}

pub struct WriterHandle {
    join: JoinHandle<()>,
}

impl WriterHandle {
    /// Wait for the writer to flush what is left. Returns once every
    /// [`InfluxSink`] clone has been dropped and the final batch is written.
    pub async fn closed(self) {
        if let Err(e) = self.join.await {
            error!(error = %e, "influx writer task failed");
        }
    }
}

pub fn spawn_writer<W: LineWriter>(writer: W, settings: WriteConfig) -> (InfluxSink, WriterHandle) {
    let (tx, mut rx) = mpsc::channel::<Point>(settings.max_buffer_points.max(1));
    let join = tokio::spawn(async move {
        let batch_size = settings.batch_size.max(1);
        let mut buf: Vec<String> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(Duration::from_millis(settings.flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(point) => {
                        buf.push(point.to_line_protocol());
                        if buf.len() >= batch_size {
                            flush(&writer, &mut buf, &settings, "size").await;
                        }
                    }
                    None => {
                        flush(&writer, &mut buf, &settings, "close").await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    flush(&writer, &mut buf, &settings, "interval").await;
                }
            }
        }
        debug!("influx writer stopped");
    });
    (InfluxSink { tx }, WriterHandle { join })
}

async fn flush<W: LineWriter>(writer: &W, buf: &mut Vec<String>, settings: &WriteConfig, reason: &str) {
    if buf.is_empty() {
        return;
    }
    let count = buf.len();
    let body = buf.join("\n");
    buf.clear();

    let mut delay = Duration::from_millis(settings.retry_delay_ms);
    let mut attempt = 0;
    loop {
        match writer.write_lines(body.clone()).await {
            Ok(()) => {
                debug!(count, reason, "batch flushed");
                return;
            }
            Err(e) if e.is_retryable() && attempt < settings.max_retries => {
                attempt += 1;
                warn!(count, attempt, error = %e, "write failed; retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                error!(count, attempts = attempt + 1, error = %e, "dropping batch");
                return;
            }
        }
    }
}
