//! Scalar metric sinks for training curves.
//!
//! Training loops report named scalars (`dynamics/loss`, `policy/objective`,
//! `episode/return`, ...) through [`MetricsSink`]; the backend decides
//! whether they go to the log, a CSV file or memory.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Destination for named scalar series.
pub trait MetricsSink {
    /// Records `value` for series `name` at `step`.
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    /// Flushes buffered output.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flushes and releases the backend. Further writes are dropped.
    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// Emits every scalar as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        tracing::info!(metric = name, value, step, "scalar");
        Ok(())
    }
}

/// Appends `name,step,value` rows to a CSV file.
///
/// The file is flushed when the sink is closed or dropped.
#[derive(Debug)]
pub struct CsvSink {
    writer: Option<BufWriter<File>>,
}

impl CsvSink {
    /// Creates (or truncates) the CSV file at `path` and writes the header.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "name,step,value")?;
        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl MetricsSink for CsvSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{},{},{}", name, step, value)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to flush metrics file");
        }
    }
}

/// Keeps every scalar in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Vec<(String, usize, f64)>,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(step, value)` pairs of series `name`, in insertion order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|&(_, step, value)| (step, value))
            .collect()
    }

    /// Number of recorded scalars.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        if !self.closed {
            self.records.push((name.to_string(), step, value));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Fans every call out to several sinks.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with<S: MetricsSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for MultiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl MetricsSink for MultiSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.add_scalar(name, value, step)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_groups_series() {
        let mut sink = MemorySink::new();
        sink.add_scalar("loss", 1.0, 0).unwrap();
        sink.add_scalar("reward", -3.0, 0).unwrap();
        sink.add_scalar("loss", 0.5, 1).unwrap();
        assert_eq!(sink.series("loss"), vec![(0, 1.0), (1, 0.5)]);
        assert_eq!(sink.len(), 3);
        sink.close().unwrap();
        sink.add_scalar("loss", 0.1, 2).unwrap();
        assert_eq!(sink.len(), 3);
        assert!(sink.is_closed());
    }

    #[test]
    fn csv_sink_writes_rows_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("metrics.csv");
        {
            let mut sink = CsvSink::new(&path).unwrap();
            sink.add_scalar("dynamics/loss", 0.25, 3).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "name,step,value\ndynamics/loss,3,0.25\n");
    }

    #[test]
    fn csv_sink_ignores_writes_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut sink = CsvSink::new(&path).unwrap();
        sink.add_scalar("a", 1.0, 0).unwrap();
        sink.close().unwrap();
        sink.add_scalar("a", 2.0, 1).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn multi_sink_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.csv");
        let mut sink = MultiSink::new()
            .with(TracingSink)
            .with(CsvSink::new(&path).unwrap());
        assert_eq!(sink.len(), 2);
        sink.add_scalar("x", 1.5, 0).unwrap();
        sink.close().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("x,0,1.5"));
    }
}
