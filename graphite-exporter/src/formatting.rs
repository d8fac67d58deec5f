//! Helpers for rendering gauges in the Prometheus exposition format.
use indexmap::IndexMap;

/// Writes a help (description) line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_help_line(buffer: &mut String, name: &str, desc: &str) {
    buffer.push_str("# HELP ");
    buffer.push_str(name);
    buffer.push(' ');
    let desc = sanitize_description(desc);
    buffer.push_str(&desc);
    buffer.push('\n');
}

/// Writes a metric type line in the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_type_line(buffer: &mut String, name: &str, metric_type: &str) {
    buffer.push_str("# TYPE ");
    buffer.push_str(name);
    buffer.push(' ');
    buffer.push_str(metric_type);
    buffer.push('\n');
}

/// Writes a single sample in the Prometheus [exposition format].
///
/// Label keys are sanitized and label values are escaped. A missing value is written as `NaN`.
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn write_metric_line(
    buffer: &mut String,
    name: &str,
    labels: &IndexMap<String, String>,
    value: Option<f64>,
) {
    buffer.push_str(name);

    if !labels.is_empty() {
        buffer.push('{');

        let mut first = true;
        for (key, value) in labels {
            if first {
                first = false;
            } else {
                buffer.push(',');
            }
            buffer.push_str(&sanitize_label_key(key));
            buffer.push_str("=\"");
            buffer.push_str(&sanitize_label_value(value));
            buffer.push('"');
        }

        buffer.push('}');
    }

    buffer.push(' ');
    buffer.push_str(&format_value(value));
    buffer.push('\n');
}

/// Formats a gauge value the way Prometheus expects to parse it.
pub fn format_value(value: Option<f64>) -> String {
    match value {
        None => "NaN".to_owned(),
        Some(v) if v.is_nan() => "NaN".to_owned(),
        Some(v) if v == f64::INFINITY => "+Inf".to_owned(),
        Some(v) if v == f64::NEG_INFINITY => "-Inf".to_owned(),
        Some(v) => v.to_string(),
    }
}

/// Sanitizes a metric name to be valid under the Prometheus [data model].
///
/// Graphite separators such as `.` and `-` become `_`.
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_metric_name(name: &str) -> String {
    replace_invalid(name, valid_metric_name_start_character, valid_metric_name_character)
}

/// Sanitizes a label key to be valid under the Prometheus [data model].
///
/// [data model]: https://prometheus.io/docs/concepts/data_model/#metric-names-and-labels
pub fn sanitize_label_key(key: &str) -> String {
    replace_invalid(key, valid_label_key_start_character, valid_label_key_character)
}

/// Escapes a label value for the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn sanitize_label_value(value: &str) -> String {
    escape(value, true)
}

/// Escapes a `# HELP` description for the Prometheus [exposition format].
///
/// [exposition format]: https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md#text-format-details
pub fn sanitize_description(value: &str) -> String {
    escape(value, false)
}

fn replace_invalid(input: &str, start: fn(char) -> bool, rest: fn(char) -> bool) -> String {
    let mut chars = input.chars();
    let mut sanitized = String::with_capacity(input.len());
    if let Some(c) = chars.next() {
        sanitized.push(if start(c) { c } else { '_' });
    }
    sanitized.extend(chars.map(|c| if rest(c) { c } else { '_' }));
    sanitized
}

// Descriptions keep their double quotes; only label values are quoted.
fn escape(value: &str, quotes: bool) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '"' if quotes => escaped.push_str("\\\""),
            c => escaped.push(c),
        }
    }
    escaped
}

#[inline]
fn valid_metric_name_start_character(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

#[inline]
pub(crate) fn valid_metric_name_character(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

#[inline]
fn valid_label_key_start_character(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

#[inline]
fn valid_label_key_character(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
