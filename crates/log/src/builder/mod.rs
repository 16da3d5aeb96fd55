//! Logger builder implementation

#[macro_use]
mod format;

use tracing::Subscriber;
use tracing_subscriber::fmt::TestWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{Config, Format, WriterConfig};
use crate::error::{LogError, LogResult};

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Guard that keeps the logger alive
///
/// Holds the entered root span (when a service name is configured) for the
/// lifetime of the guard.
#[derive(Debug)]
pub struct LoggerGuard {
    #[allow(dead_code)]
    root_span: Option<tracing::span::EnteredSpan>,
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Parse the filter directive without installing anything
    pub fn filter(&self) -> LogResult<EnvFilter> {
        EnvFilter::try_new(&self.config.level).map_err(|e| LogError::Filter {
            filter: self.config.level.clone(),
            reason: e.to_string(),
        })
    }

    /// Build and install the global subscriber
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Filter string cannot be parsed
    /// - A global subscriber has already been installed
    pub fn build(self) -> LogResult<LoggerGuard> {
        let filter = self.filter()?;
        let fmt_layer = fmt_layer(&self.config);

        Registry::default()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| LogError::Init(e.to_string()))?;

        let root_span = self
            .config
            .service
            .as_deref()
            .map(|service| tracing::info_span!("stratum", service).entered());

        Ok(LoggerGuard { root_span })
    }
}

fn make_writer(writer: WriterConfig) -> BoxMakeWriter {
    match writer {
        WriterConfig::Stderr => BoxMakeWriter::new(std::io::stderr),
        WriterConfig::Stdout => BoxMakeWriter::new(std::io::stdout),
        WriterConfig::Test => BoxMakeWriter::new(TestWriter::new()),
    }
}

fn fmt_layer<S>(config: &Config) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let writer = make_writer(config.writer);
    match config.format {
        Format::Pretty => create_fmt_layer!(pretty, &config.display, writer),
        Format::Compact => create_fmt_layer!(compact, &config.display, writer),
        Format::Json => create_json_layer!(&config.display, writer),
    }
}

impl LoggerGuard {
    pub(crate) fn noop() -> Self {
        Self { root_span: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_rejected_before_install() {
        let config = Config {
            level: "os::vm=notalevel".into(),
            ..Config::default()
        };
        let err = LoggerBuilder::from_config(config)
            .build()
            .expect_err("filter must not parse");
        assert!(matches!(err, LogError::Filter { .. }));
    }

    #[test]
    fn component_directives_parse() {
        let config = Config {
            level: "warn,os::pagesize=info,os::malloc=debug".into(),
            ..Config::default()
        };
        assert!(LoggerBuilder::from_config(config).filter().is_ok());
    }
}
