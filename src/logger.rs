use chrono::{DateTime, Utc};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{io::Write, path::PathBuf};

use crate::error::ControlError;
use crate::types::ProcedureId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Step,
    Succeeded,
    Failed,
    Cancelled,
    AwaitingConfirmation,
    Recovery,
}

/// One line of the procedure event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureEvent {
    pub timestamp: DateTime<Utc>,
    pub procedure: Option<ProcedureId>,
    pub kind: EventKind,
    pub message: String,
}

impl ProcedureEvent {
    pub fn new(procedure: Option<ProcedureId>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            procedure,
            kind,
            message: message.into(),
        }
    }
}

/// Buffered JSONL writer
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        let mut path = file_path.into();
        if path.extension() != Some(std::ffi::OsStr::new("jsonl")) {
            path.set_extension("jsonl");
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), ControlError> {
        self.buffer.push(data);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    /// Append the buffer to the file. Transient failures keep the buffer and
    /// only become an error after `max_flush_failures` in a row.
    pub fn flush(&mut self) -> Result<(), ControlError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer() {
            Ok(()) => {
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                log::error!(
                    "Event log flush failure {}/{}: {}",
                    self.flush_failures,
                    self.max_flush_failures,
                    e
                );

                if self.flush_failures >= self.max_flush_failures {
                    return Err(ControlError::Io(std::io::Error::other(format!(
                        "Too many consecutive flush failures ({}) for {:?}",
                        self.max_flush_failures, self.file_path
                    ))));
                }
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), ControlError> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = std::io::BufWriter::new(file);
        for data in &self.buffer {
            writeln!(writer, "{}", serde_json::to_string(data)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Every entry written so far
    pub fn read_back(&self) -> Result<Vec<T>, ControlError> {
        let content = std::fs::read_to_string(&self.file_path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ControlError::from))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Shared procedure event log. Lifecycle events flush immediately, steps are buffered.
#[derive(Debug)]
pub struct ProcedureEventLog {
    inner: Mutex<Logger<ProcedureEvent>>,
}

impl ProcedureEventLog {
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize) -> Self {
        Self {
            inner: Mutex::new(Logger::new(file_path, buffer_size)),
        }
    }

    /// `<dir>/procedures_<timestamp>.jsonl`
    pub fn in_directory<P: Into<PathBuf>>(dir: P) -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = dir.into().join(format!("procedures_{}.jsonl", stamp));
        info!("Procedure events go to {}", path.display());
        Self::new(path, 16)
    }

    pub fn record(&self, procedure: Option<ProcedureId>, kind: EventKind, message: impl Into<String>) {
        let mut logger = self.inner.lock();
        let event = ProcedureEvent::new(procedure, kind, message);
        let mut result = logger.add(event);
        if result.is_ok() && kind != EventKind::Step {
            result = logger.flush();
        }
        if let Err(e) = result {
            log::warn!("Could not write procedure event: {}", e);
        }
    }

    pub fn flush(&self) -> Result<(), ControlError> {
        self.inner.lock().flush()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path().clone()
    }

    pub fn read_back(&self) -> Result<Vec<ProcedureEvent>, ControlError> {
        let mut logger = self.inner.lock();
        logger.flush()?;
        logger.read_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sputter-events-{}-{}", std::process::id(), name))
    }

    #[test]
    fn buffers_until_full() {
        let path = temp_path("buffer");
        let mut logger: Logger<ProcedureEvent> = Logger::new(&path, 3);
        let path = logger.path().clone();
        logger
            .add(ProcedureEvent::new(None, EventKind::Step, "one"))
            .unwrap();
        logger
            .add(ProcedureEvent::new(None, EventKind::Step, "two"))
            .unwrap();
        assert_eq!(logger.len(), 2);
        assert!(!path.exists());

        logger
            .add(ProcedureEvent::new(None, EventKind::Step, "three"))
            .unwrap();
        assert!(logger.is_empty());
        assert_eq!(logger.read_back().unwrap().len(), 3);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn lifecycle_events_flush_immediately() {
        let log = ProcedureEventLog::new(temp_path("lifecycle"), 100);
        log.record(Some(ProcedureId::Pump), EventKind::Step, "Opening rough valve");
        log.record(Some(ProcedureId::Pump), EventKind::Failed, "rough vacuum not reached");

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        let events = log.read_back().unwrap();
        assert_eq!(events[1].kind, EventKind::Failed);
        assert_eq!(events[1].procedure, Some(ProcedureId::Pump));
        let _ = std::fs::remove_file(log.path());
    }
}
