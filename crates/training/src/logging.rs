//! Evaluation logging: stdout lines plus an optional JSONL metrics sink.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use crate::{config::TrainingError, metrics::EvaluationSummary};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub metrics_file: Option<PathBuf>,
}

pub struct Logger {
    settings: LoggingSettings,
    sink: Option<BufWriter<File>>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let sink = match settings.metrics_file.as_ref() {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| {
                        TrainingError::runtime(format!(
                            "failed to open metrics file {}: {err}",
                            path.display()
                        ))
                    })?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Self { settings, sink })
    }

    pub fn log_evaluation(&mut self, summary: &EvaluationSummary) {
        if self.settings.enable_stdout {
            println!(
                "eval samples={} correct={} acc={:.2}% loss={:.4}",
                summary.samples,
                summary.correct,
                summary.accuracy * 100.0,
                summary.average_loss
            );
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Ok(line) = serde_json::to_string(summary) {
                let _ = writeln!(sink, "{line}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            let _ = sink.flush();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}
