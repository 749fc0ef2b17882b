//! DataDog events and service checks.

use std::fmt::{self, Write};

use crate::format::{self, LineFormat};
use crate::message::{Cardinality, Tags};

/// Priority of an [`Event`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    Low,
    Normal,
}

impl Priority {
    fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
        }
    }
}

/// Alert type of an [`Event`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertType {
    Error,
    Warning,
    Info,
    Success,
}

impl AlertType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Success => "success",
        }
    }
}

/// An event posted to the event stream.
///
/// ```
/// use relay_dogstatsd::{AlertType, Event};
///
/// let event = Event::new("deploy", "version 1.2.3 rolled out")
///     .alert_type(AlertType::Success)
///     .tag("service:api");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub(crate) title: String,
    text: String,
    timestamp: Option<u64>,
    hostname: Option<String>,
    aggregation_key: Option<String>,
    priority: Option<Priority>,
    source_type_name: Option<String>,
    alert_type: Option<AlertType>,
    tags: Tags,
    cardinality: Cardinality,
}

impl Event {
    /// Creates an event with a title and a body text.
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            timestamp: None,
            hostname: None,
            aggregation_key: None,
            priority: None,
            source_type_name: None,
            alert_type: None,
            tags: Tags::new(),
            cardinality: Cardinality::Default,
        }
    }

    /// Sets the unix timestamp of the event in seconds.
    pub fn timestamp(mut self, secs: u64) -> Self {
        self.timestamp = Some(secs);
        self
    }

    /// Overrides the host name the event is attributed to.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Groups events with equal keys in the event stream.
    pub fn aggregation_key(mut self, key: impl Into<String>) -> Self {
        self.aggregation_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn source_type_name(mut self, name: impl Into<String>) -> Self {
        self.source_type_name = Some(name.into());
        self
    }

    pub fn alert_type(mut self, alert_type: AlertType) -> Self {
        self.alert_type = Some(alert_type);
        self
    }

    /// Appends a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub(crate) fn default_cardinality(&mut self, cardinality: Cardinality) {
        self.cardinality = cardinality.or(self.cardinality);
    }

    pub(crate) fn render(&self, out: &mut String, format: &LineFormat) -> fmt::Result {
        let title = format::escape_event_text(&self.title);
        let text = format::escape_event_text(&self.text);

        write!(out, "_e{{{},{}}}:{title}|{text}", title.len(), text.len())?;

        if let Some(timestamp) = self.timestamp {
            write!(out, "|d:{timestamp}")?;
        }
        if let Some(ref hostname) = self.hostname {
            write!(out, "|h:{hostname}")?;
        }
        if let Some(ref key) = self.aggregation_key {
            write!(out, "|k:{key}")?;
        }
        if let Some(priority) = self.priority {
            write!(out, "|p:{}", priority.as_str())?;
        }
        if let Some(ref source) = self.source_type_name {
            write!(out, "|s:{source}")?;
        }
        if let Some(alert_type) = self.alert_type {
            write!(out, "|t:{}", alert_type.as_str())?;
        }

        format.write_tags(out, self.tags.iter());
        format.write_origin(out, self.cardinality);
        Ok(())
    }
}

/// Status reported by a [`ServiceCheck`], rendered as integer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceCheckStatus {
    Ok = 0,
    Warning = 1,
    Critical = 2,
    Unknown = 3,
}

/// The result of a health check of a service.
///
/// ```
/// use relay_dogstatsd::{ServiceCheck, ServiceCheckStatus};
///
/// let check = ServiceCheck::new("db.reachable", ServiceCheckStatus::Critical)
///     .message("connection refused");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceCheck {
    name: String,
    status: ServiceCheckStatus,
    timestamp: Option<u64>,
    hostname: Option<String>,
    message: Option<String>,
    tags: Tags,
    cardinality: Cardinality,
}

impl ServiceCheck {
    pub fn new(name: impl Into<String>, status: ServiceCheckStatus) -> Self {
        Self {
            name: name.into(),
            status,
            timestamp: None,
            hostname: None,
            message: None,
            tags: Tags::new(),
            cardinality: Cardinality::Default,
        }
    }

    /// Sets the unix timestamp of the check in seconds.
    pub fn timestamp(mut self, secs: u64) -> Self {
        self.timestamp = Some(secs);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Attaches a human readable description of the status.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Appends a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub(crate) fn default_cardinality(&mut self, cardinality: Cardinality) {
        self.cardinality = cardinality.or(self.cardinality);
    }

    pub(crate) fn render(&self, out: &mut String, format: &LineFormat) -> fmt::Result {
        write!(out, "_sc|{}|{}", self.name, self.status as u8)?;

        if let Some(timestamp) = self.timestamp {
            write!(out, "|d:{timestamp}")?;
        }
        if let Some(ref hostname) = self.hostname {
            write!(out, "|h:{hostname}")?;
        }

        format.write_tags(out, self.tags.iter());
        format.write_origin(out, self.cardinality);

        // The message must be the last field.
        if let Some(ref message) = self.message {
            out.push_str("|m:");
            out.push_str(&format::escape_service_check_message(message));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_event(event: &Event, format: &LineFormat) -> String {
        let mut out = String::new();
        event.render(&mut out, format).unwrap();
        out
    }

    fn render_check(check: &ServiceCheck, format: &LineFormat) -> String {
        let mut out = String::new();
        check.render(&mut out, format).unwrap();
        out
    }

    #[test]
    fn test_render_event_minimal() {
        let event = Event::new("title", "text");
        insta::assert_snapshot!(render_event(&event, &LineFormat::default()), @"_e{5,4}:title|text");
    }

    #[test]
    fn test_render_event_full() {
        let event = Event::new("deploy", "line one\nline two")
            .timestamp(1_700_000_000)
            .hostname("web-1")
            .aggregation_key("deploys")
            .priority(Priority::Low)
            .source_type_name("ci")
            .alert_type(AlertType::Success)
            .tag("service:api")
            .cardinality(Cardinality::Low);

        let format = LineFormat::new(["env:prod"], Some("cid".to_owned()));
        insta::assert_snapshot!(
            render_event(&event, &format),
            @r"_e{6,18}:deploy|line one\nline two|d:1700000000|h:web-1|k:deploys|p:low|s:ci|t:success|#env:prod,service:api|c:cid|card:low"
        );
    }

    #[test]
    fn test_render_event_utf8_length() {
        let event = Event::new("café", "ü");
        insta::assert_snapshot!(render_event(&event, &LineFormat::default()), @"_e{5,2}:café|ü");
    }

    #[test]
    fn test_render_service_check() {
        let check = ServiceCheck::new("db.reachable", ServiceCheckStatus::Critical)
            .timestamp(1_700_000_000)
            .hostname("db-1")
            .message("refused\nm: retry later")
            .tag("db:main");

        insta::assert_snapshot!(
            render_check(&check, &LineFormat::default()),
            @r"_sc|db.reachable|2|d:1700000000|h:db-1|#db:main|m:refused\nm\: retry later"
        );
    }

    #[test]
    fn test_render_service_check_origin_before_message() {
        let check = ServiceCheck::new("ping", ServiceCheckStatus::Ok).message("fine");
        let format = LineFormat::new(Vec::<String>::new(), Some("cid".to_owned()));
        insta::assert_snapshot!(render_check(&check, &format), @"_sc|ping|0|c:cid|m:fine");
    }
}
