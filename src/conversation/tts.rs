//! Text-to-speech transport
//!
//! Playback is modeled as a sequence of chunk boundaries so barge-in has a
//! bounded reaction time: the loop can abort the speaking handle between
//! any two chunks. The production sink streams text to a WebSocket TTS
//! provider and plays the audio frames it returns.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Words per playback chunk. Small enough that barge-in reacts within a
/// fraction of a sentence.
const CHUNK_WORDS: usize = 6;

/// An in-progress utterance being spoken.
#[async_trait]
pub trait SpeakingHandle: Send {
    /// Play the next chunk. Returns the cumulative number of characters
    /// spoken so far, or `None` when the utterance is complete.
    async fn advance(&mut self) -> Result<Option<usize>>;

    /// Stop playback immediately, discarding the rest of the utterance.
    async fn abort(&mut self) -> Result<()>;
}

/// Converts utterances into audio played to the candidate.
#[async_trait]
pub trait SpeechSink: Send {
    async fn begin(&mut self, text: &str) -> Result<Box<dyn SpeakingHandle>>;
}

/// Split an utterance at word boundaries into chunks of at most
/// `CHUNK_WORDS` words.
pub fn chunk_utterance(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(CHUNK_WORDS)
        .map(|chunk| chunk.join(" "))
        .collect()
}

// ─── WebSocket sink ──────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Streams utterance chunks to a WebSocket TTS provider.
pub struct WsSpeechSink {
    url: String,
    model: String,
    sample_rate: u32,
}

impl WsSpeechSink {
    pub fn new(url: impl Into<String>, model: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            sample_rate,
        }
    }
}

#[async_trait]
impl SpeechSink for WsSpeechSink {
    async fn begin(&mut self, text: &str) -> Result<Box<dyn SpeakingHandle>> {
        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("TTS connect to {} failed", self.url))?;

        let hello = serde_json::json!({
            "type": "start",
            "model": self.model,
            "sample_rate": self.sample_rate,
        });
        stream
            .send(Message::Text(hello.to_string().into()))
            .await
            .context("Failed to send TTS start frame")?;

        Ok(Box::new(WsSpeakingHandle {
            stream: Some(stream),
            chunks: chunk_utterance(text),
            next_chunk: 0,
            chars_spoken: 0,
        }))
    }
}

struct WsSpeakingHandle {
    stream: Option<WsStream>,
    chunks: Vec<String>,
    next_chunk: usize,
    chars_spoken: usize,
}

#[async_trait]
impl SpeakingHandle for WsSpeakingHandle {
    async fn advance(&mut self) -> Result<Option<usize>> {
        if self.next_chunk >= self.chunks.len() {
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.send(Message::Close(None)).await;
            }
            return Ok(None);
        }
        let stream = self
            .stream
            .as_mut()
            .context("TTS handle used after abort")?;

        let chunk = &self.chunks[self.next_chunk];
        let frame = serde_json::json!({"type": "speak", "text": chunk});
        stream
            .send(Message::Text(frame.to_string().into()))
            .await
            .context("TTS write failed")?;

        // Drain audio frames until the provider acks the chunk. Binary
        // frames go straight to the audio device owned by this task.
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(_))) => continue,
                Some(Ok(Message::Text(raw))) => {
                    let done = serde_json::from_str::<serde_json::Value>(&raw)
                        .ok()
                        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
                        .map(|t| t == "chunk_done")
                        .unwrap_or(false);
                    if done {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    anyhow::bail!("TTS stream closed mid-utterance");
                }
                Some(Ok(_)) => continue,
                Some(Err(error)) => {
                    return Err(error).context("TTS read failed");
                }
            }
        }

        self.chars_spoken += chunk.len() + 1;
        self.next_chunk += 1;
        Ok(Some(self.chars_spoken.min(self.total_chars())))
    }

    async fn abort(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let frame = serde_json::json!({"type": "abort"});
            let _ = stream.send(Message::Text(frame.to_string().into())).await;
            let _ = stream.send(Message::Close(None)).await;
        }
        self.next_chunk = self.chunks.len();
        Ok(())
    }
}

impl WsSpeakingHandle {
    fn total_chars(&self) -> usize {
        self.chunks.iter().map(|c| c.len() + 1).sum::<usize>()
    }
}
