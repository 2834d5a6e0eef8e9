use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use snafu::ResultExt as _;
use tokio::task::spawn_blocking;

use super::LogRecord;
use crate::error::{Encode, ExportError, Io};

/// A destination for correlated log records.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Returns a short name for the sink, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Writes a single record.
    ///
    /// # Errors
    ///
    /// If the record could not be written, an error is returned.
    async fn write(&self, record: &LogRecord) -> Result<(), ExportError>;
}

/// Writes records as JSON lines to one or more local writers.
///
/// Writes happen on the blocking thread pool, one record at a time.
pub struct JsonLinesSink {
    writers: Arc<Mutex<Vec<Box<dyn Write + Send>>>>,
}

impl JsonLinesSink {
    /// Creates a sink writing to the given writer.
    pub fn from_writer<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            writers: Arc::new(Mutex::new(vec![Box::new(writer)])),
        }
    }

    /// Creates a sink writing to standard output and appending to the file at `path`.
    ///
    /// The file is created if it does not exist.
    ///
    /// # Errors
    ///
    /// If the file cannot be opened, an error is returned.
    pub fn stdout_and_file<P: AsRef<Path>>(path: P) -> Result<Self, ExportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(Io { sink: "log file" })?;

        Ok(Self {
            writers: Arc::new(Mutex::new(vec![Box::new(io::stdout()), Box::new(file)])),
        })
    }

    /// Adds another writer that every record is also written to.
    pub fn with_writer<W>(self, writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.writers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(writer));
        self
    }
}

#[async_trait]
impl LogSink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "local log"
    }

    async fn write(&self, record: &LogRecord) -> Result<(), ExportError> {
        let mut line = serde_json::to_vec(record).context(Encode { sink: "local log" })?;
        line.push(b'\n');

        let writers = Arc::clone(&self.writers);
        spawn_blocking(move || {
            let mut writers = writers.lock().unwrap_or_else(PoisonError::into_inner);
            writers.iter_mut().try_for_each(|writer| {
                writer.write_all(&line)?;
                writer.flush()
            })
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
        .context(Io { sink: "local log" })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead as _, BufReader},
        sync::Arc,
    };

    use serde_json::{Map, Value};

    use super::*;
    use crate::{
        config::CorrelationLabel,
        correlation::CorrelationId,
        logger::{CorrelatedLogger, LogLevel},
    };

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn record(id: u128, message: &str) -> LogRecord {
        let logger = CorrelatedLogger::new(
            CorrelationLabel::default(),
            "demo",
            JsonLinesSink::from_writer(io::sink()),
        );
        logger.record(LogLevel::Info, &CorrelationId::from_trace_id(id), Map::new(), message)
    }

    #[tokio::test]
    async fn writes_one_line_per_record_to_every_writer() {
        let first = SharedBuffer::default();
        let second = SharedBuffer::default();
        let sink = JsonLinesSink::from_writer(first.clone()).with_writer(second.clone());

        sink.write(&record(1, "one")).await.unwrap();
        sink.write(&record(2, "two")).await.unwrap();

        for buffer in [first, second] {
            let contents = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
            let lines = contents.lines().collect::<Vec<_>>();
            assert_eq!(lines.len(), 2);

            let parsed = serde_json::from_str::<Value>(lines[1]).unwrap();
            assert_eq!(parsed["msg"], "two");
            assert_eq!(parsed["traceId"], CorrelationId::from_trace_id(2).as_str());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_keep_lines_whole() {
        let buffer = SharedBuffer::default();
        let sink = Arc::new(JsonLinesSink::from_writer(buffer.clone()));

        let handles = (0..8u128)
            .map(|id| {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    for i in 0..25 {
                        sink.write(&record(id, &format!("record {}", i))).await.unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }

        let contents = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        let lines = contents
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(lines.len(), 200);
    }

    #[tokio::test]
    async fn appends_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.txt");
        std::fs::write(&path, "existing\n").unwrap();

        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let sink = JsonLinesSink::from_writer(file);
        sink.write(&record(3, "three")).await.unwrap();

        let reader = BufReader::new(std::fs::File::open(&path).unwrap());
        let lines = reader.lines().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "existing");
        assert!(lines[1].contains("\"msg\":\"three\""));
    }
}
