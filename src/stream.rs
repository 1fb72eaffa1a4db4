//! Decoding of the generation backend's server-sent event stream.

use crate::errors::{AppError, AppResult};
use crate::models::FileMap;
use serde::{Deserialize, Serialize};

const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GenerationEvent {
    Status {
        content: String,
    },
    File {
        filename: String,
    },
    Complete {
        files: FileMap,
        #[serde(rename = "filesCount", default)]
        files_count: Option<u64>,
    },
    Error {
        message: String,
    },
}

/// Incremental frame decoder. Frames are separated by a blank line; only
/// `data: {json}` lines are decoded.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    skipped: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<GenerationEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut events = Vec::new();
        while let Some(index) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..index + 2).collect();
            self.decode_frame(frame.trim_end_matches('\n'), &mut events);
        }
        events
    }

    /// Decodes whatever remains once the stream has closed.
    pub fn finish(&mut self) -> Vec<GenerationEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        if !rest.trim().is_empty() {
            self.decode_frame(rest.trim_end_matches('\n'), &mut events);
        }
        events
    }

    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }

    fn decode_frame(&mut self, frame: &str, events: &mut Vec<GenerationEvent>) {
        for line in frame.lines() {
            let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
                continue;
            };
            match serde_json::from_str::<GenerationEvent>(payload) {
                Ok(event) => events.push(event),
                Err(error) => {
                    self.skipped += 1;
                    tracing::warn!(error = %error, "skipping malformed generation event");
                }
            }
        }
    }
}

/// Decodes a complete recorded stream and returns the generated files.
pub fn collect_files(raw: &str) -> AppResult<FileMap> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.push(raw);
    events.extend(decoder.finish());
    if decoder.skipped_frames() > 0 {
        tracing::warn!(skipped = decoder.skipped_frames(), "generation stream had malformed frames");
    }

    let mut files = None;
    for event in events {
        match event {
            GenerationEvent::Status { content } => tracing::debug!(status = %content, "generation status"),
            GenerationEvent::File { filename } => tracing::debug!(file = %filename, "generated file"),
            GenerationEvent::Complete { files: complete, files_count } => {
                tracing::info!(files = complete.len(), reported = ?files_count, "generation complete");
                files = Some(complete);
            }
            GenerationEvent::Error { message } => {
                return Err(AppError::Internal(format!("generation failed: {}", message)));
            }
        }
    }
    files.ok_or_else(|| AppError::Internal("generation stream ended without a complete event".to_string()))
}
