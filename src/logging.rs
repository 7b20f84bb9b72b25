//! Log routing for the service process
//!
//! A service has no console. Formatted events are either appended to the
//! configured log file or cut into single lines and handed to a [`LineSink`],
//! which on Windows is the Application event log.

use crate::config::BridgeConfig;
use std::io;
use std::sync::Arc;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Receiver of pre-formatted log lines
pub trait LineSink: Send + Sync + 'static {
    fn write_line(&self, level: Level, line: &str);
}

impl<F> LineSink for F
where
    F: Fn(Level, &str) + Send + Sync + 'static,
{
    fn write_line(&self, level: Level, line: &str) {
        self(level, line)
    }
}

/// `MakeWriter` feeding a [`LineSink`]
///
/// Each writer carries the level of the event it formats, so the sink can
/// map it to its own severity.
#[derive(Clone)]
pub struct SinkWriter {
    sink: Arc<dyn LineSink>,
}

impl SinkWriter {
    pub fn new(sink: impl LineSink) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }
}

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter::new(Arc::clone(&self.sink), Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        LineWriter::new(Arc::clone(&self.sink), *meta.level())
    }
}

/// Buffers output and emits it line by line
///
/// Empty lines are dropped and surrounding whitespace is trimmed. Whatever
/// is left without a trailing newline is emitted when the writer is dropped.
pub struct LineWriter {
    sink: Arc<dyn LineSink>,
    level: Level,
    buf: Vec<u8>,
}

impl LineWriter {
    fn new(sink: Arc<dyn LineSink>, level: Level) -> Self {
        Self {
            sink,
            level,
            buf: Vec::new(),
        }
    }

    fn emit(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim();
        if !line.is_empty() {
            self.sink.write_line(self.level, line);
        }
    }
}

impl io::Write for LineWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line);
        }

        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
    }
}

/// Initialize logging for service mode
pub fn init_service(config: &BridgeConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if let Some(path) = config.log_file() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path);

        match file {
            Ok(file) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(file).with_ansi(false))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Warning: Failed to open log file: {}", e);
            }
        }
    }

    match default_sink(config) {
        Some(writer) => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_level(false)
                    .without_time(),
            )
            .init(),
        None => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(io::sink))
            .init(),
    }
}

#[cfg(windows)]
fn default_sink(config: &BridgeConfig) -> Option<SinkWriter> {
    match crate::service::eventlog::EventLogSink::register(&config.service_name) {
        Ok(sink) => Some(SinkWriter::new(sink)),
        Err(e) => {
            eprintln!("Warning: Failed to open event log: {}", e);
            None
        }
    }
}

#[cfg(not(windows))]
fn default_sink(_config: &BridgeConfig) -> Option<SinkWriter> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;

    type Lines = Arc<Mutex<Vec<(Level, String)>>>;

    fn collector() -> (SinkWriter, Lines) {
        let lines: Lines = Arc::default();
        let captured = Arc::clone(&lines);
        let writer = SinkWriter::new(move |level: Level, line: &str| {
            captured.lock().push((level, line.to_string()));
        });
        (writer, lines)
    }

    #[test]
    fn test_splits_and_trims_lines() {
        let (writer, lines) = collector();

        {
            let mut w = writer.make_writer();
            w.write_all(b"first\n  second  \n\n").unwrap();
            w.write_all(b"par").unwrap();
            w.write_all(b"tial").unwrap();
            assert_eq!(lines.lock().len(), 2);
        }

        let lines = lines.lock();
        let texts: Vec<&str> = lines.iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "partial"]);
        assert!(lines.iter().all(|(level, _)| *level == Level::INFO));
    }

    #[test]
    fn test_event_level_reaches_sink() {
        let (writer, lines) = collector();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer)
            .with_ansi(false)
            .without_time()
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!("pipe accept failed");
            tracing::error!("bind failed");
        });

        let lines = lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, Level::WARN);
        assert!(lines[0].1.contains("pipe accept failed"));
        assert_eq!(lines[1].0, Level::ERROR);
        assert!(lines[1].1.contains("bind failed"));
    }
}
