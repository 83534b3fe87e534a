//! Plain-text data export.
//!
//! A preamble records the start timestamp and the net's
//! initialisation parameters, a header names the columns (`time`
//! plus one per aggregator and storage tag), one data line is
//! written per scheduled log event, and a footer records the end
//! timestamp. The sink is a file path, a directory (file name
//! generated from the net name and parameters), standard output, or
//! a caller-supplied writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::PathBuf;

use chrono::Local;

use crate::device::StorageRecord;
use crate::error::{FieldcastError, FieldcastResult};
use crate::time::SimTime;

// ── Sink ──────────────────────────────────────────────────────────────

/// Where the log stream goes.
pub enum LogSink {
    Stdout,
    /// Write to this file.
    Path(PathBuf),
    /// Write to an auto-named file inside this directory.
    Dir(PathBuf),
    /// Write to a caller-supplied stream.
    Writer(Box<dyn Write + Send>),
}

impl LogSink {
    fn open(self, name: &str, params: &[(String, String)]) -> FieldcastResult<(Box<dyn Write + Send>, String)> {
        let io_err = |path: &str| {
            let path = path.to_string();
            move |source| FieldcastError::Io { path, source }
        };
        match self {
            LogSink::Stdout => Ok((Box::new(std::io::stdout()), "<stdout>".into())),
            LogSink::Path(path) => {
                let shown = path.display().to_string();
                let file = File::create(&path).map_err(io_err(&shown))?;
                Ok((Box::new(file), shown))
            }
            LogSink::Dir(dir) => {
                let mut stem = String::from(name);
                for (key, value) in params {
                    stem.push('_');
                    stem.push_str(key);
                    stem.push('-');
                    stem.push_str(value);
                }
                let path = dir.join(format!("{stem}.txt"));
                let shown = path.display().to_string();
                let file = File::create(&path).map_err(io_err(&shown))?;
                Ok((Box::new(file), shown))
            }
            LogSink::Writer(w) => Ok((w, "<writer>".into())),
        }
    }
}

// ── Aggregators ───────────────────────────────────────────────────────

/// A per-column summary over the device population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Count,
    Sum,
    Min,
    Max,
    Mean,
}

impl Aggregator {
    /// Column name for a storage tag, e.g. `mean(value)`.
    pub fn column(&self, tag: &str) -> String {
        let op = match self {
            Aggregator::Count => "count",
            Aggregator::Sum => "sum",
            Aggregator::Min => "min",
            Aggregator::Max => "max",
            Aggregator::Mean => "mean",
        };
        format!("{op}({tag})")
    }

    fn compute(&self, values: &[f64]) -> f64 {
        match self {
            Aggregator::Count => values.len() as f64,
            Aggregator::Sum => values.iter().sum(),
            Aggregator::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregator::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregator::Mean => {
                if values.is_empty() {
                    f64::NAN
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
        }
    }
}

// ── Logger ────────────────────────────────────────────────────────────

const BANNER: &str = "##########################################################";

/// The text-log sink for one net.
pub struct Logger<S: StorageRecord> {
    out: BufWriter<Box<dyn Write + Send>>,
    path: String,
    aggregators: Vec<Aggregator>,
    next: SimTime,
    period: f64,
    finished: bool,
    _storage: PhantomData<fn(S)>,
}

impl<S: StorageRecord> std::fmt::Debug for Logger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("path", &self.path)
            .field("next", &self.next)
            .field("period", &self.period)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<S: StorageRecord> Logger<S> {
    /// Open the sink and write the preamble and header.
    pub fn open(
        sink: LogSink,
        aggregators: Vec<Aggregator>,
        start: SimTime,
        period: f64,
        name: &str,
        params: &[(String, String)],
    ) -> FieldcastResult<Self> {
        let (out, path) = sink.open(name, params)?;
        let mut logger = Logger {
            out: BufWriter::new(out),
            path,
            aggregators,
            next: start,
            period,
            finished: false,
            _storage: PhantomData,
        };
        logger.preamble(name, params)?;
        Ok(logger)
    }

    fn io(&self, source: std::io::Error) -> FieldcastError {
        FieldcastError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn preamble(&mut self, name: &str, params: &[(String, String)]) -> FieldcastResult<()> {
        let stamp = Local::now().format("%a %b %e %T %Y");
        writeln!(self.out, "{BANNER}").map_err(|e| self.io(e))?;
        writeln!(self.out, "# fieldcast data export started at: {stamp}")
            .map_err(|e| self.io(e))?;
        writeln!(self.out, "{BANNER}").map_err(|e| self.io(e))?;
        let mut line = format!("# name = {name}");
        for (key, value) in params {
            line.push_str(&format!(", {key} = {value}"));
        }
        writeln!(self.out, "{line}").map_err(|e| self.io(e))?;
        writeln!(self.out, "#").map_err(|e| self.io(e))?;
        writeln!(self.out, "# The columns have the following meaning:")
            .map_err(|e| self.io(e))?;

        let mut header = String::from("# time");
        for tag in S::tags() {
            for aggregator in &self.aggregators {
                header.push(' ');
                header.push_str(&aggregator.column(tag));
            }
        }
        writeln!(self.out, "{header}").map_err(|e| self.io(e))?;
        Ok(())
    }

    /// Next scheduled log event.
    pub fn next(&self) -> SimTime {
        self.next
    }

    /// Aggregate one snapshot of the population and write a row.
    pub fn write_row<'a>(
        &mut self,
        now: SimTime,
        storages: impl Iterator<Item = &'a S>,
    ) -> FieldcastResult<()>
    where
        S: 'a,
    {
        let tag_count = S::tags().len();
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); tag_count];
        for storage in storages {
            let values = storage.values();
            debug_assert_eq!(values.len(), tag_count);
            for (column, value) in columns.iter_mut().zip(values) {
                column.push(value);
            }
        }

        let mut line = format!("{}", now.secs());
        for column in &columns {
            for aggregator in &self.aggregators {
                line.push(' ');
                line.push_str(&format!("{}", aggregator.compute(column)));
            }
        }
        writeln!(self.out, "{line}").map_err(|e| self.io(e))?;
        self.next = self.next.plus(self.period);
        Ok(())
    }

    /// Write the footer and flush. Idempotent.
    pub fn finish(&mut self) -> FieldcastResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let stamp = Local::now().format("%a %b %e %T %Y");
        writeln!(self.out, "{BANNER}").map_err(|e| self.io(e))?;
        writeln!(self.out, "# fieldcast data export finished at: {stamp}")
            .map_err(|e| self.io(e))?;
        writeln!(self.out, "{BANNER}").map_err(|e| self.io(e))?;
        self.out.flush().map_err(|e| self.io(e))
    }
}

impl<S: StorageRecord> Drop for Logger<S> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// A writer that appends into a shared buffer, so tests can read
    /// back what the logger produced.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sample_logger(buf: &SharedBuf) -> Logger<f64> {
        Logger::open(
            LogSink::Writer(Box::new(buf.clone())),
            vec![Aggregator::Count, Aggregator::Mean],
            SimTime::ZERO,
            1.0,
            "test",
            &[("seed".into(), "42".into())],
        )
        .unwrap()
    }

    #[test]
    fn test_preamble_header_rows_footer() {
        let buf = SharedBuf::default();
        let mut logger = sample_logger(&buf);
        logger
            .write_row(SimTime::ZERO, [1.0, 2.0, 3.0].iter())
            .unwrap();
        logger
            .write_row(SimTime::new(1.0), [2.0, 2.0].iter())
            .unwrap();
        logger.finish().unwrap();

        let text = buf.contents();
        assert!(text.contains("# fieldcast data export started at:"));
        assert!(text.contains("# name = test, seed = 42"));
        assert!(text.contains("# time count(value) mean(value)"));
        assert!(text.contains("\n0 3 2\n"));
        assert!(text.contains("\n1 2 2\n"));
        assert!(text.contains("# fieldcast data export finished at:"));
    }

    #[test]
    fn test_schedule_advances_per_row() {
        let buf = SharedBuf::default();
        let mut logger = sample_logger(&buf);
        assert_eq!(logger.next(), SimTime::ZERO);
        logger.write_row(SimTime::ZERO, [].iter()).unwrap();
        assert_eq!(logger.next(), SimTime::new(1.0));
    }

    #[test]
    fn test_aggregators() {
        let xs = [1.0, 2.0, 4.0];
        assert_eq!(Aggregator::Count.compute(&xs), 3.0);
        assert_eq!(Aggregator::Sum.compute(&xs), 7.0);
        assert_eq!(Aggregator::Min.compute(&xs), 1.0);
        assert_eq!(Aggregator::Max.compute(&xs), 4.0);
        assert!((Aggregator::Mean.compute(&xs) - 7.0 / 3.0).abs() < 1e-12);
        assert_eq!(Aggregator::Mean.column("value"), "mean(value)");
    }

    #[test]
    fn test_dir_sink_generates_name() {
        let dir = tempfile::tempdir().unwrap();
        let logger: Logger<f64> = Logger::open(
            LogSink::Dir(dir.path().to_path_buf()),
            vec![Aggregator::Mean],
            SimTime::ZERO,
            1.0,
            "run",
            &[("seed".into(), "7".into()), ("retain".into(), "5".into())],
        )
        .unwrap();
        drop(logger);
        assert!(dir.path().join("run_seed-7_retain-5.txt").exists());
    }

    #[test]
    fn test_unwritable_path_is_io_error() {
        let err = Logger::<f64>::open(
            LogSink::Path(PathBuf::from("/nonexistent-dir/out.txt")),
            vec![Aggregator::Mean],
            SimTime::ZERO,
            1.0,
            "x",
            &[],
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
