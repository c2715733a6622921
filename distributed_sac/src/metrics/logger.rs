//! Training loggers.
//!
//! Every logger consumes the [`TrainMetrics`] record produced by one learning
//! step. The trainer decides how often to log; loggers write every record
//! they are given.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::algorithms::sac::TrainMetrics;

/// Logger trait for different logging backends.
pub trait MetricsLogger: Send {
    /// Log one training record.
    fn log(&mut self, metrics: &TrainMetrics);

    /// Flush any buffered output.
    fn flush(&mut self);
}

/// Emits each record through `log::info!`.
pub struct ConsoleLogger {
    start_time: Instant,
    last_step: u64,
    last_time: Instant,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_step: 0,
            last_time: now,
        }
    }

    /// Reset the start time.
    pub fn reset_timer(&mut self) {
        self.start_time = Instant::now();
        self.last_time = self.start_time;
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsLogger for ConsoleLogger {
    fn log(&mut self, metrics: &TrainMetrics) {
        let now = Instant::now();
        let window = now.duration_since(self.last_time).as_secs_f32();
        let rate = if window > 0.0 {
            metrics.step.saturating_sub(self.last_step) as f32 / window
        } else {
            0.0
        };

        log::info!(
            "step {:>8} | actor {:>9.4} | critic {:>9.4} | reward {:>8.3} ± {:<7.3} | entropy {:>8.3} ± {:<7.3} | memory {:>8} | {:>6.1} steps/s | {:.0}s",
            metrics.step,
            metrics.loss_actor,
            metrics.loss_critic,
            metrics.reward_mean,
            metrics.reward_std,
            metrics.entropy_mean,
            metrics.entropy_std,
            metrics.memory_size,
            rate,
            self.start_time.elapsed().as_secs_f32(),
        );

        self.last_step = metrics.step;
        self.last_time = now;
    }

    fn flush(&mut self) {}
}

/// CSV file logger for analysis.
pub struct CsvLogger {
    writer: BufWriter<File>,
    start_time: Instant,
}

impl CsvLogger {
    /// Create the file (truncating it) and write the header.
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(
            writer,
            "step,loss_actor,loss_critic,reward_mean,reward_std,entropy_mean,entropy_std,memory_size,elapsed_secs"
        )?;

        Ok(Self {
            writer,
            start_time: Instant::now(),
        })
    }
}

impl MetricsLogger for CsvLogger {
    fn log(&mut self, metrics: &TrainMetrics) {
        let result = writeln!(
            self.writer,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{},{:.2}",
            metrics.step,
            metrics.loss_actor,
            metrics.loss_critic,
            metrics.reward_mean,
            metrics.reward_std,
            metrics.entropy_mean,
            metrics.entropy_std,
            metrics.memory_size,
            self.start_time.elapsed().as_secs_f32(),
        );
        if let Err(e) = result {
            log::warn!("Could not write metrics row: {}", e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            log::warn!("Could not flush metrics file: {}", e);
        }
    }
}

impl Drop for CsvLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Multi-logger that writes to multiple backends.
#[derive(Default)]
pub struct MultiLogger {
    loggers: Vec<Box<dyn MetricsLogger>>,
}

impl MultiLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a logger.
    pub fn add<L: MetricsLogger + 'static>(mut self, logger: L) -> Self {
        self.loggers.push(Box::new(logger));
        self
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricsLogger for MultiLogger {
    fn log(&mut self, metrics: &TrainMetrics) {
        for logger in &mut self.loggers {
            logger.log(metrics);
        }
    }

    fn flush(&mut self) {
        for logger in &mut self.loggers {
            logger.flush();
        }
    }
}
