//! Delivery-log sinks.
//!
//! The post-auction loop appends one newline-delimited JSON record per
//! terminal event. The file sink is the production default; the channel
//! sink lets tests observe emissions; the null sink discards.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use rtb_common::events::DeliveryRecord;

/// Where terminal post-auction records go.
pub trait DeliverySink: Send + Sync {
    /// Append one record. Must not block the shard for long; failures are
    /// logged, never propagated into the matcher.
    fn emit(&self, record: DeliveryRecord);

    /// Flush buffered output, if any.
    fn flush(&self) {}
}

/// Append-only NDJSON file sink.
pub struct FileSink {
    writer: Mutex<BufWriter<File>>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening delivery log {}", path.display()))?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl DeliverySink for FileSink {
    fn emit(&self, record: DeliveryRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "unserializable delivery record dropped");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(err) = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
        {
            warn!(%err, "delivery log write failed");
        }
    }

    fn flush(&self) {
        if let Err(err) = self.writer.lock().flush() {
            warn!(%err, "delivery log flush failed");
        }
    }
}

/// Test sink: records arrive on an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DeliveryRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeliveryRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DeliverySink for ChannelSink {
    fn emit(&self, record: DeliveryRecord) {
        let _ = self.tx.send(record);
    }
}

/// Discards everything.
pub struct NullSink;

impl DeliverySink for NullSink {
    fn emit(&self, _record: DeliveryRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtb_common::events::DeliveryKind;
    use rtb_common::ids::AuctionId;

    fn record() -> DeliveryRecord {
        DeliveryRecord::new(AuctionId::from("a-1"), DeliveryKind::Won)
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = std::env::temp_dir().join(format!("rtb-sink-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("delivery.ndjson");
        let _ = std::fs::remove_file(&path);

        let sink = FileSink::create(&path).unwrap();
        sink.emit(record());
        sink.emit(record());
        sink.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DeliveryRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.kind, DeliveryKind::Won);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(record());
        let got = rx.try_recv().unwrap();
        assert_eq!(got.kind, DeliveryKind::Won);
    }

    #[test]
    fn test_null_sink_discards() {
        NullSink.emit(record());
    }
}
