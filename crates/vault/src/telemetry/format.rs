//! One-JSON-object-per-line event format.
//!
//! Every line carries `timestamp`, `level`, `message`, `tenant_id`,
//! `correlation_id` and `component`. The last three are `null` for events that
//! do not record them (system-level events). Fields named after secret
//! material are replaced with `"[REDACTED]"` before serialisation.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Field names whose values must never reach a log sink.
pub const REDACTED_FIELDS: &[&str] = &[
    "plaintext",
    "secret",
    "token",
    "dek",
    "key_material",
    "ciphertext",
    "wrapped_dek",
];

/// Context fields present on every line, `null` when absent.
pub const CONTEXT_FIELDS: [&str; 3] = ["tenant_id", "correlation_id", "component"];

const REDACTED: &str = "[REDACTED]";

/// [`FormatEvent`] implementation producing the vault's structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEventFormat;

impl<S, N> FormatEvent<S, N> for JsonEventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let line = render(meta.level(), meta.target(), visitor.0);
        writeln!(writer, "{line}")
    }
}

/// Assemble the output object from an event's recorded fields.
fn render(level: &Level, target: &str, mut fields: Map<String, Value>) -> Value {
    let mut out = Map::new();
    out.insert(
        "timestamp".into(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    out.insert("level".into(), Value::String(level.to_string()));
    out.insert(
        "message".into(),
        fields
            .remove("message")
            .unwrap_or_else(|| Value::String(String::new())),
    );
    for key in CONTEXT_FIELDS {
        out.insert(key.into(), fields.remove(key).unwrap_or(Value::Null));
    }
    out.insert("target".into(), Value::String(target.to_owned()));
    out.extend(fields);
    Value::Object(out)
}

#[derive(Default)]
struct FieldVisitor(Map<String, Value>);

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        let name = field.name();
        let value = if REDACTED_FIELDS.contains(&name) {
            Value::String(REDACTED.into())
        } else {
            value
        };
        self.0.insert(name.to_owned(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        let v = Number::from_f64(value).map_or(Value::Null, Value::Number);
        self.insert(field, v);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::String(value.to_owned()));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buf {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buf {
        type Writer = Buf;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<Value> {
        let buf = Buf::default();
        let subscriber = tracing_subscriber::fmt()
            .event_format(JsonEventFormat)
            .with_writer(buf.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn system_event_has_null_context_fields() {
        let lines = capture(|| tracing::info!(workers = 4u64, "pool started"));
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line["message"], "pool started");
        assert_eq!(line["level"], "INFO");
        assert!(line["timestamp"].is_string());
        assert!(line["tenant_id"].is_null());
        assert!(line["correlation_id"].is_null());
        assert!(line["component"].is_null());
        assert_eq!(line["workers"], 4);
    }

    #[test]
    fn context_fields_are_top_level() {
        let lines = capture(|| {
            tracing::warn!(
                tenant_id = "t1",
                correlation_id = "c-1",
                component = "credential_store",
                "lookup failed"
            )
        });
        let line = &lines[0];
        assert_eq!(line["tenant_id"], "t1");
        assert_eq!(line["correlation_id"], "c-1");
        assert_eq!(line["component"], "credential_store");
        assert_eq!(line["level"], "WARN");
    }

    #[test]
    fn secret_fields_are_redacted() {
        let lines = capture(|| tracing::info!(token = "ya29.secret", dek = ?[1u8, 2, 3], "oops"));
        let line = &lines[0];
        assert_eq!(line["token"], REDACTED);
        assert_eq!(line["dek"], REDACTED);
        assert!(!line.to_string().contains("ya29.secret"));
    }
}
