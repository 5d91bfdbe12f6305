use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Local};
use serde_json::Value;

use crate::{Error, HookLogger, Level};

/// Context key carrying the module name a call should be routed to.
pub const CTX_KEY_NAME: &str = "moduleName";

/// Structured fields of an entry, sorted by key.
pub type Fields = BTreeMap<String, Value>;

/// Value stored in a [`Context`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Text(String),
    /// A value of any other shape, kept only as its rendering.
    Opaque(String),
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::Text(value.into())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::Text(value)
    }
}

/// Immutable, call-scoped key/value set travelling with an entry.
///
/// Adding a value returns a new context; the original is left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    values: BTreeMap<String, ContextValue>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context routing every call to `module`.
    pub fn for_module(module: &str) -> Self {
        Self::new().with_value(CTX_KEY_NAME, module)
    }

    pub fn with_value<K: Into<String>, V: Into<ContextValue>>(&self, key: K, value: V) -> Self {
        let mut values = self.values.clone();
        values.insert(key.into(), value.into());
        Self { values }
    }

    pub fn value(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    /// The module tag, whatever its shape.
    pub fn module(&self) -> Option<&ContextValue> {
        self.value(CTX_KEY_NAME)
    }
}

/// A single log record as seen by hooks.
#[derive(Debug, Clone)]
pub struct Entry {
    pub level: Level,
    pub message: String,
    pub time: DateTime<Local>,
    pub target: String,
    pub fields: Fields,
    pub context: Option<Context>,
}

impl Entry {
    pub fn new<M: Into<String>>(level: Level, message: M) -> Self {
        Self {
            level,
            message: message.into(),
            time: Local::now(),
            target: String::new(),
            fields: Fields::new(),
            context: None,
        }
    }

    pub fn with_field<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_target(self, target: &str) -> Self {
        Self {
            target: target.into(),
            ..self
        }
    }

    pub fn with_context(self, context: Context) -> Self {
        Self {
            context: Some(context),
            ..self
        }
    }

    /// The entry's context routed to `module`.
    pub fn with_module(self, module: &str) -> Self {
        let context = self
            .context
            .as_ref()
            .map(|context| context.with_value(CTX_KEY_NAME, module))
            .unwrap_or_else(|| Context::for_module(module));
        self.with_context(context)
    }
}

/// Logger-like handle bound to a context, as returned by module registration.
///
/// Every call made through the handle carries its context, so a handle
/// obtained from `RouteHook::add("billing", ..)` always lands on the
/// `billing` route.
#[derive(Clone)]
pub struct ModuleLogger {
    logger: Arc<HookLogger>,
    context: Context,
    fields: Fields,
}

impl fmt::Debug for ModuleLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLogger")
            .field("context", &self.context)
            .field("fields", &self.fields)
            .finish()
    }
}

impl ModuleLogger {
    pub fn new(logger: Arc<HookLogger>, context: Context) -> Self {
        Self {
            logger,
            context,
            fields: Fields::new(),
        }
    }

    pub fn logger(&self) -> &Arc<HookLogger> {
        &self.logger
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// A copy of this handle whose calls also carry `key=value`.
    pub fn with_field<K: Into<String>, V: Into<Value>>(&self, key: K, value: V) -> Self {
        let mut handle = self.clone();
        handle.fields.insert(key.into(), value.into());
        handle
    }

    pub fn with_fields<I, K, V>(&self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut handle = self.clone();
        handle
            .fields
            .extend(fields.into_iter().map(|(k, v)| (k.into(), v.into())));
        handle
    }

    fn entry(&self, level: Level, message: String) -> Entry {
        Entry {
            fields: self.fields.clone(),
            context: Some(self.context.clone()),
            ..Entry::new(level, message)
        }
    }

    /// Emits an entry; hook failures are reported on stderr by the logger.
    pub fn log<M: fmt::Display>(&self, level: Level, message: M) {
        if !self.logger.is_level_enabled(level) {
            return;
        }
        self.logger.log_entry(self.entry(level, message.to_string()));
    }

    /// Emits an entry and returns the first hook failure, if any.
    pub fn try_log<M: fmt::Display>(&self, level: Level, message: M) -> Result<(), Error> {
        if !self.logger.is_level_enabled(level) {
            return Ok(());
        }
        let mut entry = self.entry(level, message.to_string());
        self.logger.fire_hooks(&mut entry)
    }

    pub fn trace<M: fmt::Display>(&self, message: M) {
        self.log(Level::Trace, message)
    }

    pub fn debug<M: fmt::Display>(&self, message: M) {
        self.log(Level::Debug, message)
    }

    pub fn info<M: fmt::Display>(&self, message: M) {
        self.log(Level::Info, message)
    }

    pub fn warn<M: fmt::Display>(&self, message: M) {
        self.log(Level::Warn, message)
    }

    pub fn error<M: fmt::Display>(&self, message: M) {
        self.log(Level::Error, message)
    }

    /// Logs at fatal level, then exits the process with status 1.
    pub fn fatal<M: fmt::Display>(&self, message: M) -> ! {
        self.log(Level::Fatal, message);
        std::process::exit(1)
    }

    /// Logs at panic level, then panics with the same message.
    pub fn panic<M: fmt::Display>(&self, message: M) -> ! {
        let message = message.to_string();
        self.log(Level::Panic, &message);
        panic!("{message}")
    }
}
