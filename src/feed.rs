//! Upstream feed adapters.
//!
//! A feed hands the writer already-parsed messages tagged with their stream.
//! Reconnecting to an exchange is the feed's business; the writer only sees a
//! sequence that ends with `None`.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::mpsc;

use crate::models::{Message, MessageKind, StreamId};

/// One message addressed to a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub stream: StreamId,
    pub message: Message,
}

#[async_trait]
pub trait MessageSource: Send {
    /// Next message. `Ok(None)` means the feed ended; an `Err` is one bad
    /// record and the source stays usable.
    async fn next_item(&mut self) -> Result<Option<FeedItem>>;
}

// =============================================================================
// JSON LINES
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    ts: Option<WireTimestamp>,
    kind: MessageKind,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    payload_b64: Option<String>,
}

/// Parse one feed line. `default_stream` applies when the record names none.
///
/// ```text
/// {"stream":"btc","ts":1767225600123,"kind":"deal","payload":"97000.5|0.01|1"}
/// ```
pub fn parse_line(line: &str, default_stream: Option<&StreamId>) -> Result<FeedItem> {
    let record: WireRecord = serde_json::from_str(line)?;

    let stream = match (record.stream, default_stream) {
        (Some(raw), _) => StreamId::parse(&raw)?,
        (None, Some(default)) => default.clone(),
        (None, None) => bail!("record has no stream and no default stream is configured"),
    };

    let timestamp = match record.ts {
        Some(WireTimestamp::Millis(ms)) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| anyhow!("ts out of range: {}", ms))?,
        Some(WireTimestamp::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .with_context(|| format!("bad ts {:?}", text))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let payload = match (record.payload_b64, record.payload) {
        (Some(encoded), _) => BASE64.decode(encoded.as_bytes()).context("bad payload_b64")?,
        (None, Some(text)) => text.into_bytes(),
        (None, None) => Vec::new(),
    };

    Ok(FeedItem {
        stream,
        message: Message::new(timestamp, record.kind, payload),
    })
}

/// JSON Lines reader over any async byte source (stdin, a file, a socket).
pub struct JsonLinesSource<R> {
    lines: Lines<BufReader<R>>,
    default_stream: Option<StreamId>,
    line_no: u64,
}

impl<R: AsyncRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R, default_stream: Option<StreamId>) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            default_stream,
            line_no: 0,
        }
    }
}

impl JsonLinesSource<tokio::io::Stdin> {
    pub fn stdin(default_stream: Option<StreamId>) -> Self {
        Self::new(tokio::io::stdin(), default_stream)
    }
}

impl JsonLinesSource<tokio::fs::File> {
    pub async fn open(path: &std::path::Path, default_stream: Option<StreamId>) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open feed {}", path.display()))?;
        Ok(Self::new(file, default_stream))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageSource for JsonLinesSource<R> {
    async fn next_item(&mut self) -> Result<Option<FeedItem>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return parse_line(&line, self.default_stream.as_ref())
                .map(Some)
                .with_context(|| format!("feed line {}", self.line_no));
        }
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Feed backed by an mpsc channel, for embedding the writer in-process.
pub struct ChannelSource {
    rx: mpsc::Receiver<FeedItem>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<FeedItem>) -> Self {
        Self { rx }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<FeedItem>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_item(&mut self) -> Result<Option<FeedItem>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_variants() {
        let item = parse_line(
            r#"{"stream":"BTC","ts":1767225600123,"kind":"deal","payload":"97000.5|0.01|1"}"#,
            None,
        )
        .unwrap();
        assert_eq!(item.stream.as_str(), "btc");
        assert_eq!(item.message.ts_millis(), 1_767_225_600_123);
        assert_eq!(item.message.payload, b"97000.5|0.01|1".to_vec());

        let eth = StreamId::parse("eth").unwrap();
        let item = parse_line(
            r#"{"ts":"2026-01-01T00:00:00.5Z","kind":"deadletter","payload_b64":"AAE="}"#,
            Some(&eth),
        )
        .unwrap();
        assert_eq!(item.stream, eth);
        assert_eq!(item.message.kind, MessageKind::DeadLetter);
        assert_eq!(item.message.payload, vec![0u8, 1]);
    }

    #[test]
    fn test_parse_line_rejects_bad_records() {
        assert!(parse_line("not json", None).is_err());
        assert!(parse_line(r#"{"kind":"deal"}"#, None).is_err());
        assert!(parse_line(r#"{"stream":"btc","kind":"trade"}"#, None).is_err());
        assert!(parse_line(r#"{"stream":"b-t-c","kind":"deal"}"#, None).is_err());
    }

    #[tokio::test]
    async fn test_jsonl_source_skips_blank_lines_and_reports_errors() {
        let input = b"{\"stream\":\"btc\",\"ts\":1,\"kind\":\"ticker\"}\n\n garbage \n{\"stream\":\"btc\",\"ts\":2,\"kind\":\"deal\"}\n";
        let mut source = JsonLinesSource::new(&input[..], None);

        let first = source.next_item().await.unwrap().unwrap();
        assert_eq!(first.message.kind, MessageKind::Ticker);
        let err = source.next_item().await.unwrap_err();
        assert!(format!("{:#}", err).contains("feed line 3"));
        let third = source.next_item().await.unwrap().unwrap();
        assert_eq!(third.message.ts_millis(), 2);
        assert!(source.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (tx, mut source) = ChannelSource::channel(4);
        let item = parse_line(r#"{"stream":"sol","ts":5,"kind":"depth"}"#, None).unwrap();
        tx.send(item.clone()).await.unwrap();
        drop(tx);
        assert_eq!(source.next_item().await.unwrap(), Some(item));
        assert_eq!(source.next_item().await.unwrap(), None);
    }
}
