//! Logging setup for the demos and for applications embedding the strategy.
//!
//! The library itself only emits `tracing` events; nothing is printed unless
//! a subscriber is installed, e.g. with [`init_logger`].

use tracing::Level;

/// Install the standard subscriber with an INFO default level.
///
/// Format: `[LEVEL YYYY-MM-DD HH:MM:SS module]` for INFO/WARN/ERROR and
/// `[LEVEL YYYY-MM-DD HH:MM:SS file:line]` for DEBUG/TRACE.
///
/// # Example
/// ```no_run
/// use apex_trust_region::init_logger;
///
/// init_logger();
/// tracing::info!("Application started");
/// ```
///
/// The level can be overridden with `RUST_LOG`, e.g.
/// `RUST_LOG=apex_trust_region=debug` shows the dogleg branch taken and the
/// radius after every update.
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the standard subscriber with a custom default level.
///
/// Calling it twice is harmless; the second installation is ignored.
pub fn init_logger_with_level(default_level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .with_level(false)
        .event_format(BracketFormatter)
        .try_init();
}

struct BracketFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for BracketFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        use chrono::Local;

        let metadata = event.metadata();
        let level = *metadata.level();

        write!(writer, "[{} ", colored_level(level))?;
        write!(writer, "{} ", Local::now().format("%Y-%m-%d %H:%M:%S"))?;

        match (level, metadata.file()) {
            (Level::DEBUG | Level::TRACE, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{}", filename)?;
                if let Some(line) = metadata.line() {
                    write!(writer, ":{}", line)?;
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
        }

        write!(writer, "] ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

fn colored_level(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}
