//! Capture sinks

use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::CaptureSink;
use crate::error::{Error, Result};
use crate::http::CapturedExchange;

/// Appends one JSON object per exchange to a file.
///
/// Bodies are written base64-encoded and every line is flushed as written.
/// File writes run on the blocking pool.
pub struct JsonlCaptureStore {
    writer: Arc<Mutex<std::io::BufWriter<std::fs::File>>>,
}

impl JsonlCaptureStore {
    /// Open (or create) the capture file in append mode.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(std::io::BufWriter::new(file))),
        })
    }

    async fn write_line(&self, json: String) -> Result<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut writer = writer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            writeln!(writer, "{}", json)?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::store(format!("Capture write task failed: {}", e)))?
    }
}

#[async_trait]
impl CaptureSink for JsonlCaptureStore {
    async fn save(&self, exchange: &CapturedExchange) -> Result<()> {
        let json = serde_json::to_string(exchange)
            .map_err(|e| Error::store(format!("Failed to serialize exchange: {}", e)))?;
        self.write_line(json).await
    }
}

/// Logs a one-line summary of each exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCaptureSink;

#[async_trait]
impl CaptureSink for TracingCaptureSink {
    async fn save(&self, exchange: &CapturedExchange) -> Result<()> {
        tracing::info!(
            method = %exchange.method,
            host = %exchange.host,
            path = %exchange.path,
            status = exchange.status,
            request_bytes = exchange.request_body.len(),
            response_bytes = exchange.response_body.len(),
            truncated = exchange.truncated,
            "Captured exchange"
        );
        Ok(())
    }
}
