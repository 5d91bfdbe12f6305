//! `log::Log` backend that turns records into [`Entry`]s and fires hooks.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use log::{Log, kv};
use serde_json::Value;

use crate::{CTX_KEY_NAME, Context, ContextValue, Entry, Error, Fields, Level, ModuleLogger};

/// Receives every entry emitted at one of its levels.
pub trait Hook: Send + Sync {
    fn levels(&self) -> &[Level];

    fn fire(&self, entry: &mut Entry) -> Result<(), Error>;
}

/// Hooks indexed by the levels they subscribed to.
#[derive(Clone, Default)]
pub struct LevelHooks {
    hooks: HashMap<Level, Vec<Arc<dyn Hook>>>,
}

impl LevelHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, hook: Arc<dyn Hook>) {
        for level in hook.levels() {
            self.hooks.entry(*level).or_default().push(Arc::clone(&hook));
        }
    }

    pub fn for_level(&self, level: Level) -> &[Arc<dyn Hook>] {
        self.hooks.get(&level).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }
}

/// Structured logger dispatching entries to hooks.
///
/// Installed with `log::set_logger` it receives every `log::info!`-style
/// record; a `moduleName` key-value on the record becomes the entry's
/// routing context.
pub struct HookLogger {
    level: RwLock<Level>,
    hooks: RwLock<LevelHooks>,
}

impl Default for HookLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl HookLogger {
    /// A logger at `Info` with no hooks.
    pub fn new() -> Self {
        Self {
            level: RwLock::new(Level::Info),
            hooks: RwLock::new(LevelHooks::new()),
        }
    }

    pub fn level(&self) -> Level {
        *self.level.read().unwrap()
    }

    pub fn set_level(&self, level: Level) {
        *self.level.write().unwrap() = level;
    }

    pub fn is_level_enabled(&self, level: Level) -> bool {
        level <= self.level()
    }

    pub fn add_hook(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().unwrap().add(hook);
    }

    /// Swaps the whole hook set, returning the previous one.
    pub fn replace_hooks(&self, hooks: LevelHooks) -> LevelHooks {
        std::mem::replace(&mut *self.hooks.write().unwrap(), hooks)
    }

    /// Fires every hook subscribed to the entry's level.
    ///
    /// Failures are reported on stderr and do not stop the remaining hooks;
    /// the first one is returned.
    pub fn fire_hooks(&self, entry: &mut Entry) -> Result<(), Error> {
        // Hooks may register routes or hooks of their own while firing.
        let hooks = self.hooks.read().unwrap().for_level(entry.level).to_vec();
        let mut result = Ok(());
        for hook in hooks {
            if let Err(err) = hook.fire(entry) {
                eprintln!("Failed to fire hook: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    pub fn log_entry(&self, mut entry: Entry) {
        let _ = self.fire_hooks(&mut entry);
    }

    /// A handle whose calls carry `context`.
    pub fn with_context(self: &Arc<Self>, context: Context) -> ModuleLogger {
        ModuleLogger::new(Arc::clone(self), context)
    }

    /// A handle whose calls are routed to `module`.
    pub fn with_module(self: &Arc<Self>, module: &str) -> ModuleLogger {
        self.with_context(Context::for_module(module))
    }
}

impl Log for HookLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.is_level_enabled(metadata.level().into())
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.log_entry(entry_from_record(record));
    }

    fn flush(&self) {}
}

/// Builds an entry from a facade record, lifting `moduleName` into the
/// context.
pub fn entry_from_record(record: &log::Record) -> Entry {
    let mut visitor = RecordVisitor::default();
    // The visitor never fails.
    let _ = record.key_values().visit(&mut visitor);
    let mut entry = Entry::new(Level::from(record.level()), record.args().to_string())
        .with_target(record.target());
    entry.fields = visitor.fields;
    if let Some(module) = visitor.module {
        entry.context = Some(Context::new().with_value(CTX_KEY_NAME, module));
    }
    entry
}

#[derive(Default)]
struct RecordVisitor {
    fields: Fields,
    module: Option<ContextValue>,
}

impl<'kvs> kv::VisitSource<'kvs> for RecordVisitor {
    fn visit_pair(&mut self, key: kv::Key<'kvs>, value: kv::Value<'kvs>) -> Result<(), kv::Error> {
        if key.as_str() == CTX_KEY_NAME {
            self.module = Some(match value.to_borrowed_str() {
                Some(module) => ContextValue::Text(module.into()),
                None => ContextValue::Opaque(value.to_string()),
            });
        } else {
            self.fields.insert(key.as_str().into(), to_json(&value));
        }
        Ok(())
    }
}

fn to_json(value: &kv::Value) -> Value {
    if let Some(b) = value.to_bool() {
        Value::from(b)
    } else if let Some(i) = value.to_i64() {
        Value::from(i)
    } else if let Some(u) = value.to_u64() {
        Value::from(u)
    } else if let Some(f) = value.to_f64() {
        Value::from(f)
    } else if let Some(s) = value.to_borrowed_str() {
        Value::from(s)
    } else {
        Value::from(value.to_string())
    }
}
