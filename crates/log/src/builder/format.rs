//! Format layer construction

/// Build a fmt layer for `$format` with the shared display options applied.
///
/// Expands to a boxed layer so callers can match over formats without
/// fighting the per-format layer types.
macro_rules! create_fmt_layer {
    ($format:ident, $display:expr, $writer:expr) => {{
        let display = $display;
        let layer = tracing_subscriber::fmt::layer()
            .$format()
            .with_writer($writer)
            .with_ansi(display.colors)
            .with_target(display.target)
            .with_file(display.source)
            .with_line_number(display.source)
            .with_thread_ids(display.thread_ids)
            .with_thread_names(display.thread_names);

        if display.time {
            layer.boxed()
        } else {
            layer.without_time().boxed()
        }
    }};
}

/// JSON variant of [`create_fmt_layer`] with the span and flatten options.
macro_rules! create_json_layer {
    ($display:expr, $writer:expr) => {{
        let display = $display;
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer($writer)
            .with_current_span(true)
            .with_span_list(display.span_list)
            .flatten_event(display.flatten)
            .with_ansi(display.colors)
            .with_target(display.target)
            .with_file(display.source)
            .with_line_number(display.source)
            .with_thread_ids(display.thread_ids)
            .with_thread_names(display.thread_names);

        if display.time {
            layer.boxed()
        } else {
            layer.without_time().boxed()
        }
    }};
}
