//! Diagnostic output for the executor.
//!
//! Every component logs through `tracing`; this module installs the
//! subscriber that renders events as
//! `[YYYY-MM-DD HH:MM:SS] [LEVEL] file:line: message` on stderr. The filter
//! defaults to warnings and errors and can be widened with `RUST_LOG`.

use std::fmt;

use tracing::{Event, Subscriber};
use tracing_subscriber::{
    EnvFilter,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    registry::LookupSpan,
};

/// Renders one event as a single diagnostic line.
struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "[{}] [{}] ",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            metadata.level()
        )?;
        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            write!(writer, "{file}:{line}: ")?;
        }
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber. Safe to call more than once; only the
/// first installation takes effect.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .event_format(LineFormat)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
