//! Measurement bodies.
//!
//! JSON and Prometheus text share one shape, a presence block followed by a
//! delimited list of `name value` entries; only the delimiters differ.

use crate::protocol::ContentType;
use crate::sensor::Reading;
use core::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementFormat {
    pub content_type: ContentType,
    /// Written before the presence value; unused when presence is disabled.
    pub presence_header: &'static str,
    pub presence_false: &'static str,
    pub presence_true: &'static str,
    /// Opens the sensor block when presence is disabled.
    pub temperature_open: &'static str,
    /// Opens the sensor block after a presence value.
    pub temperature_header: &'static str,
    pub name_start: &'static str,
    pub name_end: &'static str,
    pub separator: &'static str,
    pub footer: &'static str,
    pub footer_with_presence: &'static str,
    pub absent: &'static str,
}

/// `{"A":21.5,"B":null}` or, with presence,
/// `{"presence":true,"temperature":{"A":21.5,"B":null}}`.
pub const JSON: MeasurementFormat = MeasurementFormat {
    content_type: ContentType::Json,
    presence_header: "{\"presence\":",
    presence_false: "false",
    presence_true: "true",
    temperature_open: "{",
    temperature_header: ",\"temperature\":{",
    name_start: "\"",
    name_end: "\":",
    separator: ",",
    footer: "}",
    footer_with_presence: "}}",
    absent: "null",
};

pub const PROMETHEUS: MeasurementFormat = MeasurementFormat {
    content_type: ContentType::PlainText,
    presence_header: "# HELP presence PIR presence sensor activated\n# TYPE presence gauge\npresence ",
    presence_false: "0",
    presence_true: "1",
    temperature_open: "# HELP temperature Temperature in degrees Celsius\n# TYPE temperature gauge\n",
    temperature_header: "\n# HELP temperature Temperature in degrees Celsius\n# TYPE temperature gauge\n",
    name_start: "temperature{sensor=\"",
    name_end: "\"} ",
    separator: "\n",
    footer: "\n",
    footer_with_presence: "\n",
    absent: "NaN",
};

/// Write one measurement body. Entries are emitted in iteration order with
/// separators only between them.
pub fn render_measurements<'a, W, I>(
    out: &mut W,
    format: &MeasurementFormat,
    presence: Option<bool>,
    entries: I,
) -> core::fmt::Result
where
    W: Write,
    I: IntoIterator<Item = (&'a str, Reading)>,
{
    match presence {
        Some(present) => {
            out.write_str(format.presence_header)?;
            out.write_str(if present { format.presence_true } else { format.presence_false })?;
            out.write_str(format.temperature_header)?;
        }
        None => out.write_str(format.temperature_open)?,
    }

    for (index, (name, reading)) in entries.into_iter().enumerate() {
        if index > 0 {
            out.write_str(format.separator)?;
        }
        out.write_str(format.name_start)?;
        write_escaped(out, name)?;
        out.write_str(format.name_end)?;
        match reading {
            Reading::Celsius(value) => write!(out, "{:?}", value)?,
            Reading::Absent => out.write_str(format.absent)?,
        }
    }

    out.write_str(if presence.is_some() { format.footer_with_presence } else { format.footer })
}

// The escapes JSON strings and Prometheus label values have in common.
// `DeviceConfig::validate` keeps every other control character out of names.
fn write_escaped<W: Write>(out: &mut W, name: &str) -> core::fmt::Result {
    for c in name.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            c => out.write_char(c)?,
        }
    }
    Ok(())
}
