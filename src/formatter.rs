use std::{
    borrow::Cow,
    fmt::Write as _,
    sync::{Arc, LazyLock},
};

use colored::{Color, Colorize};
use serde_json::{Map, Value};

use crate::{Entry, Error, Level};

/// RFC 3339 with seconds precision.
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

const FIELD_KEY_TIME: &str = "time";
const FIELD_KEY_LEVEL: &str = "level";
const FIELD_KEY_MSG: &str = "msg";

/// Turns an entry into the bytes written to a destination.
pub trait Formatter: Send + Sync {
    fn format(&self, entry: &Entry) -> Result<Vec<u8>, Error>;
}

static DEFAULT_FORMATTER: LazyLock<Arc<dyn Formatter>> =
    LazyLock::new(|| Arc::new(TextFormatter::plain()));

static DEV_FORMATTER: LazyLock<Arc<dyn Formatter>> =
    LazyLock::new(|| Arc::new(TextFormatter::dev()));

/// Plain `key=value` text, meant for files.
pub fn default_formatter() -> Arc<dyn Formatter> {
    Arc::clone(&DEFAULT_FORMATTER)
}

/// Colorized text with full timestamps, meant for terminals.
pub fn dev_formatter() -> Arc<dyn Formatter> {
    Arc::clone(&DEV_FORMATTER)
}

/// Renames user fields that would shadow the fixed keys.
fn field_key(key: &str) -> Cow<'_, str> {
    match key {
        FIELD_KEY_TIME | FIELD_KEY_LEVEL | FIELD_KEY_MSG => Cow::Owned(format!("fields.{key}")),
        _ => Cow::Borrowed(key),
    }
}

/// Text formatter in two flavours: plain `key=value` pairs, or a colorized
/// terminal layout.
#[derive(Debug, Clone)]
pub struct TextFormatter {
    colors: bool,
    full_timestamp: bool,
    timestamp_format: String,
}

impl TextFormatter {
    pub fn plain() -> Self {
        Self {
            colors: false,
            full_timestamp: true,
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.into(),
        }
    }

    pub fn dev() -> Self {
        Self {
            colors: true,
            ..Self::plain()
        }
    }

    pub fn with_colors(self, colors: bool) -> Self {
        Self { colors, ..self }
    }

    /// Without it the colorized layout prints no timestamp at all.
    pub fn with_full_timestamp(self, full_timestamp: bool) -> Self {
        Self {
            full_timestamp,
            ..self
        }
    }

    /// Any `chrono` format string.
    pub fn with_timestamp_format(self, timestamp_format: &str) -> Self {
        Self {
            timestamp_format: timestamp_format.into(),
            ..self
        }
    }

    fn write_plain(&self, out: &mut String, entry: &Entry) -> std::fmt::Result {
        let time = entry.time.format(&self.timestamp_format).to_string();
        write!(out, "{FIELD_KEY_TIME}=")?;
        write_value(out, &Value::String(time))?;
        write!(out, " {FIELD_KEY_LEVEL}={} {FIELD_KEY_MSG}=", entry.level)?;
        write_value(out, &Value::String(entry.message.clone()))?;
        for (key, value) in &entry.fields {
            write!(out, " {}=", field_key(key))?;
            write_value(out, value)?;
        }
        Ok(())
    }

    fn write_colored(&self, out: &mut String, entry: &Entry) -> std::fmt::Result {
        let color = level_color(entry.level);
        let level_text = entry.level.as_str().to_uppercase();
        let level_text = &level_text[..level_text.len().min(4)];
        write!(out, "{}", level_text.color(color))?;
        if self.full_timestamp {
            write!(out, "[{}]", entry.time.format(&self.timestamp_format))?;
        }
        write!(out, " {:<44}", entry.message.trim_end_matches('\n'))?;
        for (key, value) in &entry.fields {
            let key = field_key(key);
            write!(out, " {}=", (&*key).color(color))?;
            write_value(out, value)?;
        }
        Ok(())
    }
}

impl Default for TextFormatter {
    fn default() -> Self {
        Self::plain()
    }
}

impl Formatter for TextFormatter {
    fn format(&self, entry: &Entry) -> Result<Vec<u8>, Error> {
        let mut out = String::with_capacity(128 + entry.message.len());
        let written = if self.colors {
            self.write_colored(&mut out, entry)
        } else {
            self.write_plain(&mut out, entry)
        };
        written.map_err(|err| Error::Format(err.to_string()))?;
        out.push('\n');
        Ok(out.into_bytes())
    }
}

fn level_color(level: Level) -> Color {
    match level {
        Level::Panic | Level::Fatal | Level::Error => Color::Red,
        Level::Warn => Color::Yellow,
        Level::Info => Color::Cyan,
        Level::Debug | Level::Trace => Color::White,
    }
}

fn needs_quoting(text: &str) -> bool {
    text.is_empty()
        || !text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '/' | '@' | '^' | '+'))
}

fn write_value(out: &mut String, value: &Value) -> std::fmt::Result {
    match value {
        Value::String(text) if !needs_quoting(text) => out.write_str(text),
        // JSON string escaping doubles as quoting.
        other => write!(out, "{other}"),
    }
}

/// One JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonFormatter {
    timestamp_format: String,
}

impl JsonFormatter {
    pub fn new() -> Self {
        Self {
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.into(),
        }
    }

    pub fn with_timestamp_format(self, timestamp_format: &str) -> Self {
        Self {
            timestamp_format: timestamp_format.into(),
        }
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl Formatter for JsonFormatter {
    fn format(&self, entry: &Entry) -> Result<Vec<u8>, Error> {
        let mut object = Map::with_capacity(entry.fields.len() + 3);
        for (key, value) in &entry.fields {
            object.insert(field_key(key).into_owned(), value.clone());
        }
        object.insert(
            FIELD_KEY_TIME.into(),
            entry.time.format(&self.timestamp_format).to_string().into(),
        );
        object.insert(FIELD_KEY_LEVEL.into(), entry.level.as_str().into());
        object.insert(FIELD_KEY_MSG.into(), entry.message.clone().into());
        let mut bytes = serde_json::to_vec(&Value::Object(object))
            .map_err(|err| Error::Format(err.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Entry::new(Level::Error, "disk full")
            .with_field("func", "app::store::flush")
            .with_field("line", 42)
            .with_field("msg", "shadowed")
    }

    #[test]
    fn test_plain_formatter() {
        let bytes = TextFormatter::plain().format(&entry()).unwrap();
        let line = String::from_utf8(bytes).unwrap();
        assert!(line.starts_with("time=\""));
        assert!(line.contains(" level=error msg=\"disk full\""));
        assert!(line.contains(" func=\"app::store::flush\""));
        assert!(line.contains(" line=42"));
        assert!(line.contains(" fields.msg=shadowed"));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_plain_formatter_leaves_simple_values_bare() {
        let entry = Entry::new(Level::Info, "ready").with_field("path", "/var/log/app.log");
        let line = String::from_utf8(TextFormatter::plain().format(&entry).unwrap()).unwrap();
        assert!(line.contains(" level=info msg=ready path=/var/log/app.log\n"));
    }

    #[test]
    fn test_dev_formatter() {
        let bytes = TextFormatter::dev().format(&entry()).unwrap();
        let line = String::from_utf8(bytes).unwrap();
        assert!(line.contains("ERRO"));
        assert!(line.contains("disk full"));
        assert!(line.contains("42"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_json_formatter() {
        let bytes = JsonFormatter::new().format(&entry()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["level"], "error");
        assert_eq!(value["msg"], "disk full");
        assert_eq!(value["fields.msg"], "shadowed");
        assert_eq!(value["line"], 42);
        assert!(value["time"].is_string());
    }
}
