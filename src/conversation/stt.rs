//! Speech-to-text transport
//!
//! The loop consumes STT through the `SpeechSource` trait; the production
//! implementation streams segments from a WebSocket provider and
//! reconnects with exponential backoff on transient drops. After the
//! backoff budget is exhausted the source reports a hard error and the
//! loop degrades per the failure contract.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// One transcription segment from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSegment {
    pub text: String,
    pub is_final: bool,
    /// Provider signalled end of speech (no more segments for this turn).
    #[serde(default)]
    pub end_of_speech: bool,
    pub t_start: DateTime<Utc>,
    pub t_end: DateTime<Utc>,
    pub confidence: f64,
}

/// A stream of STT segments. `None` means the provider closed cleanly.
#[async_trait]
pub trait SpeechSource: Send {
    async fn next_segment(&mut self) -> Result<Option<SttSegment>>;
}

// ─── Reconnect backoff ───────────────────────────────────────────────────

/// Exponential backoff: base 200 ms, factor 2, cap 5 s, 5 attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn stt_default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 5)
    }

    /// Delay before the next attempt, or `None` when the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let delay = self
            .base
            .checked_mul(1u32 << self.attempt.min(16))
            .map(|d| d.min(self.cap))
            .unwrap_or(self.cap);
        self.attempt += 1;
        Some(delay)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ─── WebSocket source ────────────────────────────────────────────────────

/// Wire format of a provider segment message.
#[derive(Debug, Deserialize)]
struct WireSegment {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    end_of_speech: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    duration_ms: u64,
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Streams segments from a WebSocket STT provider.
pub struct WsSpeechSource {
    url: String,
    model: String,
    stream: Option<WsStream>,
    backoff: Backoff,
}

impl WsSpeechSource {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            stream: None,
            backoff: Backoff::stt_default(),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((mut stream, _)) => {
                    let hello = serde_json::json!({
                        "type": "start",
                        "model": self.model,
                    });
                    stream
                        .send(Message::Text(hello.to_string().into()))
                        .await
                        .context("Failed to send STT start frame")?;
                    tracing::info!(url = %self.url, "STT connected");
                    self.backoff.reset();
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(error) => match self.backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(%error, ?delay, "STT connect failed, backing off");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        anyhow::bail!("STT reconnect attempts exhausted: {error}");
                    }
                },
            }
        }
    }
}

#[async_trait]
impl SpeechSource for WsSpeechSource {
    async fn next_segment(&mut self) -> Result<Option<SttSegment>> {
        loop {
            if self.stream.is_none() {
                self.connect().await?;
            }
            let stream = self.stream.as_mut().expect("connected above");

            match stream.next().await {
                Some(Ok(Message::Text(raw))) => {
                    let wire: WireSegment = match serde_json::from_str(&raw) {
                        Ok(w) => w,
                        Err(error) => {
                            tracing::warn!(%error, "Dropping malformed STT frame");
                            continue;
                        }
                    };
                    if wire.text.is_empty() && !wire.end_of_speech {
                        continue;
                    }
                    let t_end = Utc::now();
                    let t_start = t_end
                        - chrono::Duration::milliseconds(wire.duration_ms as i64);
                    return Ok(Some(SttSegment {
                        text: wire.text,
                        is_final: wire.is_final,
                        end_of_speech: wire.end_of_speech,
                        t_start,
                        t_end,
                        confidence: wire.confidence,
                    }));
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::warn!("STT stream closed, reconnecting");
                    self.stream = None;
                }
                Some(Ok(_)) => continue,
                Some(Err(error)) => {
                    tracing::warn!(%error, "STT read error, reconnecting");
                    self.stream = None;
                }
            }
        }
    }
}
