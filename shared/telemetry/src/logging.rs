use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::{Level, Subscriber};
use tracing_subscriber::{filter::FromEnvError, fmt, layer::SubscriberExt, EnvFilter, Layer};

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    Json,
    None,
}

/// Environment variable holding the filter for the log file, if set.
/// Falls back to `RUST_LOG` and then to the configured level.
const FILE_FILTER_ENV: &str = "WRITE_RUST_LOG";

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
    with_ansi: bool,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
            with_ansi: true,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    /// Set the log level
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the log file path (optional). The file is opened in append mode.
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    pub fn with_ansi(mut self, with_ansi: bool) -> Self {
        self.with_ansi = with_ansi;
        self
    }

    /// Installs the subscriber as the global default.
    pub fn init(self) -> anyhow::Result<()> {
        tracing::subscriber::set_global_default(self.build()?)?;
        Ok(())
    }

    /// Builds the subscriber without installing it.
    pub fn build(self) -> anyhow::Result<impl Subscriber + Send + Sync> {
        let level = self.level;
        let output_logs_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?;

        let make_detailed_logs_filter = || -> Result<EnvFilter, FromEnvError> {
            if std::env::var(FILE_FILTER_ENV).is_ok() {
                EnvFilter::builder()
                    .with_env_var(FILE_FILTER_ENV)
                    .from_env()
            } else {
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env()
            }
        };

        let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

        match self.output {
            LogOutput::Console => layers.push(
                fmt::layer()
                    .with_ansi(self.with_ansi)
                    .with_writer(std::io::stdout)
                    .with_filter(output_logs_filter)
                    .boxed(),
            ),
            LogOutput::Json => layers.push(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stdout)
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_filter(output_logs_filter)
                    .boxed(),
            ),
            LogOutput::None => {}
        }

        if let Some(log_file_path) = self.write_logs_file {
            let log_file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_file_path)?;

            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_filter(make_detailed_logs_filter()?)
                    .boxed(),
            );
        }

        Ok(tracing_subscriber::registry().with(layers))
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}
