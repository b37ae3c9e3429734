//! One Server-Sent Event and its wire serialization.

use std::fmt::{self, Display, Write};

/// A Server-Sent Event: required data plus optional type, id and retry
/// fields.
///
/// `Display` renders the wire form: fields in the order event, id, retry,
/// data; multi-line data split into one `data:` line per source line; a
/// blank line terminating the record.
///
/// ```
/// use surge::sse::Event;
///
/// let event = Event::new("line1\nline2").with_type("msg").with_id("42");
/// assert_eq!(
///     event.to_string(),
///     "event: msg\nid: 42\ndata: line1\ndata: line2\n\n"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    event_type: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    data: String,
}

impl Event {
    /// Create an event carrying the given data.
    pub fn new(data: impl Into<String>) -> Event {
        Event { data: data.into(), ..Default::default() }
    }

    /// Set the event type (the `event:` field). Empty types are not
    /// emitted.
    pub fn with_type(mut self, event_type: impl Into<String>) -> Event {
        self.event_type = Some(event_type.into());
        self
    }

    /// Set the event id (the `id:` field), which clients echo back in
    /// `Last-Event-ID` when reconnecting. Empty ids are not emitted.
    pub fn with_id(mut self, id: impl Into<String>) -> Event {
        self.id = Some(id.into());
        self
    }

    /// Set the reconnection delay in milliseconds (the `retry:` field).
    /// Only strictly positive values are emitted.
    pub fn with_retry(mut self, milliseconds: u64) -> Event {
        self.retry = Some(milliseconds);
        self
    }

    /// The event type, if set.
    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// The event id, if set.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The retry delay in milliseconds, if set.
    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    /// The event data.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Render an SSE comment: `: <text>` terminated like an event.
    /// Clients ignore comments; they serve as keep-alives.
    pub fn comment(text: &str) -> String {
        format!(": {text}\n\n")
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(event_type) = self.event_type.as_deref().filter(|t| !t.is_empty()) {
            f.write_str("event: ")?;
            f.write_str(event_type)?;
            f.write_char('\n')?;
        }

        if let Some(id) = self.id.as_deref().filter(|i| !i.is_empty()) {
            f.write_str("id: ")?;
            f.write_str(id)?;
            f.write_char('\n')?;
        }

        if let Some(retry) = self.retry.filter(|&ms| ms > 0) {
            write!(f, "retry: {retry}\n")?;
        }

        // Every line of data gets its own field; empty data still emits
        // one.
        for line in self.data.split('\n') {
            f.write_str("data: ")?;
            f.write_str(line)?;
            f.write_char('\n')?;
        }

        f.write_char('\n')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_line_event_wire_form() {
        let event = Event::new("line1\nline2\nline3").with_type("msg").with_id("42");
        assert_eq!(
            event.to_string(),
            "event: msg\nid: 42\ndata: line1\ndata: line2\ndata: line3\n\n"
        );
    }

    #[test]
    fn field_order_is_event_id_retry_data() {
        let event = Event::new("x").with_retry(3000).with_id("7").with_type("tick");
        assert_eq!(event.to_string(), "event: tick\nid: 7\nretry: 3000\ndata: x\n\n");
    }

    #[test]
    fn empty_data_still_emits_one_field() {
        assert_eq!(Event::new("").to_string(), "data: \n\n");
    }

    #[test]
    fn empty_type_and_id_are_suppressed() {
        let event = Event::new("x").with_type("").with_id("");
        assert_eq!(event.to_string(), "data: x\n\n");
    }

    #[test]
    fn zero_retry_is_suppressed() {
        assert_eq!(Event::new("x").with_retry(0).to_string(), "data: x\n\n");
    }

    #[test]
    fn serialized_data_lines_reparse_to_original() {
        let original = "a\n\nb\nc";
        let event = Event::new(original);
        let wire = event.to_string();

        let data: Vec<&str> = wire
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(data.join("\n"), original);
    }

    #[test]
    fn comment_form() {
        assert_eq!(Event::comment("keep-alive"), ": keep-alive\n\n");
    }
}
