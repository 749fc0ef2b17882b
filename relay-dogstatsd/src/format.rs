//! Shared helpers for rendering the DogStatsD line protocol.

use std::fmt::{self, Write};

use crate::message::Cardinality;

/// Number of fractional digits rendered for floating point values and sample rates.
const FRACTION_DIGITS: usize = 6;

/// Client-wide rendering options applied to every line.
///
/// Constant tags are rendered before the per-message tags of every metric, event and service
/// check. The container id and cardinality are appended at the very end of a line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LineFormat {
    /// Pre-joined constant tags, without the leading `|#`.
    constant_tags: String,
    /// Container id rendered as `|c:<id>`.
    container_id: Option<String>,
}

impl LineFormat {
    /// Creates a format from the client's constant tags and container id.
    pub fn new<I, S>(constant_tags: I, container_id: Option<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut joined = String::new();
        for tag in constant_tags {
            if !joined.is_empty() {
                joined.push(',');
            }
            joined.push_str(tag.as_ref());
        }

        Self {
            constant_tags: joined,
            container_id: container_id.filter(|id| !id.is_empty()),
        }
    }

    /// Writes the `|#` tag section, constant tags first. Writes nothing without any tags.
    pub fn write_tags<'a, I>(&self, out: &mut String, tags: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut first = true;
        if !self.constant_tags.is_empty() {
            out.push_str("|#");
            out.push_str(&self.constant_tags);
            first = false;
        }

        for tag in tags {
            out.push_str(if first { "|#" } else { "," });
            out.push_str(tag);
            first = false;
        }
    }

    /// Writes the trailing container id and cardinality fields.
    pub fn write_origin(&self, out: &mut String, cardinality: Cardinality) {
        if let Some(ref container_id) = self.container_id {
            out.push_str("|c:");
            out.push_str(container_id);
        }

        if let Some(value) = cardinality.as_str() {
            out.push_str("|card:");
            out.push_str(value);
        }
    }
}

/// Writes a floating point value with at most six fractional digits.
///
/// Trailing zeros are trimmed, so `1.5` renders as `1.5` and `2.0` as `2`. Non-finite values
/// render as `NaN`, `Infinity` and `-Infinity`.
pub fn write_float(out: &mut String, value: f64) -> fmt::Result {
    if value.is_nan() {
        out.push_str("NaN");
        return Ok(());
    } else if value.is_infinite() {
        out.push_str(if value > 0.0 { "Infinity" } else { "-Infinity" });
        return Ok(());
    }

    let start = out.len();
    write!(out, "{value:.FRACTION_DIGITS$}")?;

    let trimmed = out[start..].trim_end_matches('0').trim_end_matches('.').len();
    out.truncate(start + trimmed);

    if &out[start..] == "-0" {
        out.truncate(start);
        out.push('0');
    }

    Ok(())
}

/// Writes a sample rate as a fixed six decimal fraction, e.g. `|@0.500000`.
pub fn write_sample_rate(out: &mut String, rate: f64) -> fmt::Result {
    write!(out, "|@{rate:.FRACTION_DIGITS$}")
}

/// Escapes line breaks in event titles and texts.
pub fn escape_event_text(value: &str) -> String {
    value.replace("\r\n", "\\n").replace('\n', "\\n")
}

/// Escapes service check messages, which additionally must not contain `m:`.
pub fn escape_service_check_message(value: &str) -> String {
    escape_event_text(value).replace("m:", "m\\:")
}
