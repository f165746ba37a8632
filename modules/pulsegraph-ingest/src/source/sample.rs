// Live sampled stream over HTTP.
//
// The endpoint answers with newline-delimited JSON envelopes:
//
//   {"data": {...post...}, "includes": {"tweets": [...referenced posts...]}}
//
// Blank lines are keep-alives. A line that does not decode, or runs past the
// line limit, is reported as a record-level error and the session keeps going.
// A connection that sends nothing at all, not even keep-alives, for the idle
// timeout ends the session.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use pulsegraph_common::{PostEvent, PostRecord};

use super::{EventStream, SourceError, StreamSource};

const POST_FIELDS: &str =
    "id,text,lang,created_at,author_id,possibly_sensitive,referenced_tweets,entities,context_annotations";
const EXPANSIONS: &str = "referenced_tweets.id";

/// The endpoint sends a keep-alive every 20 seconds.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    data: Option<serde_json::Value>,
    #[serde(default)]
    includes: Option<Includes>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    tweets: Vec<serde_json::Value>,
}

/// Bounds on what one session may do before it is cut off.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadLimits {
    pub idle_timeout: Duration,
    pub max_line_bytes: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

pub struct SampleStream {
    client: reqwest::Client,
    url: String,
    token: String,
    limits: ReadLimits,
}

impl SampleStream {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token: token.into(),
            limits: ReadLimits::default(),
        }
    }

    /// Reconnect when nothing arrives for this long.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.limits.idle_timeout = idle_timeout;
        self
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.limits.max_line_bytes = max_line_bytes.max(1);
        self
    }
}

#[async_trait]
impl StreamSource for SampleStream {
    fn name(&self) -> &str {
        "sample-stream"
    }

    async fn start(&self) -> Result<EventStream, SourceError> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .query(&[("tweet.fields", POST_FIELDS), ("expansions", EXPANSIONS)])
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SourceError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(url = self.url.as_str(), "Connected to sampled stream");
        Ok(Box::pin(ndjson_events(resp.bytes_stream(), self.limits)))
    }
}

/// Split a byte stream into lines and decode each non-blank line as an
/// envelope. Chunk boundaries may fall anywhere, including inside a UTF-8
/// sequence.
pub(crate) fn ndjson_events<S, B, E>(
    body: S,
    limits: ReadLimits,
) -> impl Stream<Item = Result<PostEvent, SourceError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Send,
    SourceError: From<E>,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();
        // Set while skipping the rest of an oversized line.
        let mut discarding = false;

        loop {
            let chunk = match tokio::time::timeout(limits.idle_timeout, body.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    yield Err(SourceError::Idle(limits.idle_timeout));
                    return;
                }
            };
            let mut bytes = match chunk {
                Ok(bytes) => bytes.as_ref().to_vec(),
                Err(e) => {
                    yield Err(SourceError::from(e));
                    return;
                }
            };

            if discarding {
                match bytes.iter().position(|b| *b == b'\n') {
                    Some(pos) => {
                        bytes.drain(..=pos);
                        discarding = false;
                    }
                    None => continue,
                }
            }
            buffer.extend_from_slice(&bytes);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if line.len() > limits.max_line_bytes {
                    yield Err(oversized(limits.max_line_bytes));
                    continue;
                }
                if let Some(event) = decode_line(&line) {
                    yield event;
                }
            }

            if buffer.len() > limits.max_line_bytes {
                buffer.clear();
                discarding = true;
                yield Err(oversized(limits.max_line_bytes));
            }
        }

        // Trailing line without a newline.
        if !discarding {
            if let Some(event) = decode_line(&buffer) {
                yield event;
            }
        }
    }
}

fn oversized(max_line_bytes: usize) -> SourceError {
    SourceError::Decode(format!("line exceeds {max_line_bytes} bytes"))
}

/// `None` for keep-alives and envelopes that carry only errors.
fn decode_line(line: &[u8]) -> Option<Result<PostEvent, SourceError>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(SourceError::Decode(e.to_string()))),
    };
    if text.is_empty() {
        return None;
    }
    decode_envelope(text).transpose()
}

fn decode_envelope(text: &str) -> Result<Option<PostEvent>, SourceError> {
    let envelope: StreamEnvelope = serde_json::from_str(text).map_err(decode_error)?;

    let Some(data) = envelope.data else {
        debug!(errors = envelope.errors.len(), "Envelope without data");
        return Ok(None);
    };
    let post = PostRecord::from_raw(data).map_err(decode_error)?;
    let included = envelope
        .includes
        .unwrap_or_default()
        .tweets
        .into_iter()
        .map(PostRecord::from_raw)
        .collect::<Result<Vec<_>, _>>()
        .map_err(decode_error)?;
    Ok(Some(PostEvent { post, included }))
}

fn decode_error(e: serde_json::Error) -> SourceError {
    SourceError::Decode(e.to_string())
}
