use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use tracing_subscriber::{
    filter::{Directive, LevelFilter},
    fmt::format::{Format, Full, Pretty},
    prelude::*,
    util::TryInitError,
    EnvFilter,
};

/// Output format emitted to the terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum LogFormat {
    /// Human-readable, single-line logs with the current span context.
    Full,
    /// Multi-line logs, optimized for readability at a terminal.
    Pretty,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Pretty => f.write_str("pretty"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trace => f.write_str("trace"),
            Self::Debug => f.write_str("debug"),
            Self::Info => f.write_str("info"),
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
        }
    }
}

impl From<LogLevel> for Directive {
    fn from(level: LogLevel) -> Self {
        use tracing::Level;
        Directive::from(match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error => Level::ERROR,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OutputLocation {
    Stdout,
    Stderr,
}

impl Default for OutputLocation {
    fn default() -> Self {
        Self::Stderr
    }
}

impl FromStr for OutputLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            other => Err(format!("unknown log output location `{other}`")),
        }
    }
}

enum OutputFormatter {
    Full(Format<Full>),
    Pretty(Format<Pretty>),
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for OutputFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        match self {
            Self::Full(fmt) => fmt.format_event(ctx, writer, event),
            Self::Pretty(fmt) => fmt.format_event(ctx, writer, event),
        }
    }
}

/// Initializes the global `tracing` subscriber.
///
/// Mirrors the level-by-build-profile default: `debug` in debug builds, `warn` in release, unless
/// `log_level` or `RUST_LOG` says otherwise.
pub fn init_logger(
    log_format: LogFormat,
    output_location: &OutputLocation,
    log_level: Option<LogLevel>,
) -> Result<(), TryInitError> {
    let filter = if let Some(log_level) = log_level {
        EnvFilter::default().add_directive(Directive::from(log_level))
    } else {
        match std::env::var("RUST_LOG") {
            Ok(env) => EnvFilter::new(env),
            #[cfg(debug_assertions)]
            Err(_) => EnvFilter::default().add_directive(Directive::from(LevelFilter::DEBUG)),
            #[cfg(not(debug_assertions))]
            Err(_) => EnvFilter::default().add_directive(Directive::from(LevelFilter::WARN)),
        }
    };

    let formatter = tracing_subscriber::fmt::format().with_target(true);
    let output_format = match log_format {
        LogFormat::Full => OutputFormatter::Full(formatter),
        LogFormat::Pretty => OutputFormatter::Pretty(formatter.pretty()),
    };

    let writer: tracing_subscriber::fmt::writer::BoxMakeWriter = match output_location {
        OutputLocation::Stdout => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stdout),
        OutputLocation::Stderr => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(output_format)
                .with_writer(writer),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init()
}
