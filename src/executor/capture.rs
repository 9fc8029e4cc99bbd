// Sink for log records that escape a test's own dispatcher
use std::backtrace::Backtrace;
use std::io;
use std::sync::{Arc, Mutex};
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;

/// A formatted log line that reached a worker's fallback dispatcher.
#[derive(Debug, Clone)]
pub struct CapturedLogRecord {
    pub message: String,
    /// Where the record was written from
    pub backtrace: String,
}

/// Records every write instead of forwarding it anywhere.
///
/// Installed as the thread default on each worker, so anything logged on a
/// worker outside a test's own dispatcher lands here rather than on a shared
/// stream where concurrently running tests would interleave.
#[derive(Clone, Default)]
pub struct CapturingWriter {
    records: Arc<Mutex<Vec<CapturedLogRecord>>>,
}

impl CapturingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher that formats events and hands them to this writer
    pub fn dispatch(&self) -> Dispatch {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        Dispatch::new(subscriber)
    }

    pub fn records(&self) -> Vec<CapturedLogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty()
    }
}

/// Per-event handle returned by `CapturingWriter::make_writer`
pub struct CaptureHandle {
    records: Arc<Mutex<Vec<CapturedLogRecord>>>,
}

impl io::Write for CaptureHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let record = CapturedLogRecord {
            message: String::from_utf8_lossy(buf).trim_end().to_string(),
            backtrace: Backtrace::force_capture().to_string(),
        };
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturingWriter {
    type Writer = CaptureHandle;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureHandle {
            records: Arc::clone(&self.records),
        }
    }
}
