//! Per-level, per-module routed output.
//!
//! A [`RouteHook`] owns a writer table (level to destination, a fallback
//! destination, a formatter and a caller strategy) and a registry of module
//! routes. Entries whose context carries a registered `moduleName` are handed
//! to that module's hook instead; everything else uses the hook's own table.

use std::{
    collections::HashMap,
    fmt, io,
    sync::{Arc, Mutex, Weak},
};

use crate::{
    Caller, Context, ContextValue, Destination, Entry, Error, Formatter, Hook, HookLogger, Level,
    ModuleLogger, RotateFileMap, SkipCaller, config::ROUTELOG_CONFIG, default_formatter,
};

/// Field holding the resolved caller function of error-grade entries.
pub const FIELD_KEY_FUNC: &str = "func";
/// Field holding the resolved caller line of error-grade entries.
pub const FIELD_KEY_LINE: &str = "line";

/// Destination per level. Several levels may share one destination.
pub type WriterMap = HashMap<Level, Arc<dyn Destination>>;

/// What a hook writes to when created.
pub enum Output {
    /// One destination for every level, installed as the fallback.
    Single(Arc<dyn Destination>),
    PerLevel(WriterMap),
    RotatingPerLevel(RotateFileMap),
}

impl Output {
    pub fn single<D: Destination + 'static>(destination: D) -> Self {
        Output::Single(Arc::new(destination))
    }
}

impl From<Arc<dyn Destination>> for Output {
    fn from(destination: Arc<dyn Destination>) -> Self {
        Output::Single(destination)
    }
}

impl From<WriterMap> for Output {
    fn from(writers: WriterMap) -> Self {
        Output::PerLevel(writers)
    }
}

impl From<RotateFileMap> for Output {
    fn from(files: RotateFileMap) -> Self {
        Output::RotatingPerLevel(files)
    }
}

struct WriterTable {
    writers: WriterMap,
    levels: Vec<Level>,
    default_writer: Option<Arc<dyn Destination>>,
    formatter: Arc<dyn Formatter>,
    caller: Arc<dyn Caller>,
}

impl WriterTable {
    fn route(&self, level: Level) -> Option<Arc<dyn Destination>> {
        self.writers
            .get(&level)
            .or(self.default_writer.as_ref())
            .cloned()
    }

    fn is_empty(&self) -> bool {
        self.writers.is_empty() && self.default_writer.is_none()
    }
}

enum Route {
    Own,
    Table(Arc<RouteHook>),
}

struct Registry {
    routes: HashMap<String, Route>,
    logger: Option<Weak<HookLogger>>,
}

/// Hook writing entries to per-level destinations, with module routing.
///
/// Two locks guard a hook: the registry (module routes and the bound logger)
/// and the writer table. The registry lock is always released before the
/// table lock is taken. The table lock is held while an entry is formatted
/// and written, so writes through one hook never interleave.
pub struct RouteHook {
    table: Mutex<WriterTable>,
    registry: Mutex<Registry>,
}

impl fmt::Debug for RouteHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.lock().unwrap();
        f.debug_struct("RouteHook")
            .field("levels", &table.levels)
            .field("has_default_writer", &table.default_writer.is_some())
            .finish_non_exhaustive()
    }
}

impl RouteHook {
    /// Builds a hook from its output; `None` selects the plain text
    /// formatter.
    pub fn new(output: impl Into<Output>, formatter: Option<Arc<dyn Formatter>>) -> Self {
        let mut writers = WriterMap::new();
        let mut default_writer = None;
        match output.into() {
            Output::Single(destination) => default_writer = Some(destination),
            Output::PerLevel(map) => writers = map,
            Output::RotatingPerLevel(files) => {
                for (level, file) in files.iter() {
                    writers.insert(*level, Arc::clone(file) as Arc<dyn Destination>);
                }
            }
        }
        let mut levels: Vec<Level> = writers.keys().copied().collect();
        levels.sort();
        Self {
            table: Mutex::new(WriterTable {
                writers,
                levels,
                default_writer,
                formatter: formatter.unwrap_or_else(default_formatter),
                caller: Arc::new(SkipCaller::new(ROUTELOG_CONFIG.CALLER_SKIP as usize)),
            }),
            registry: Mutex::new(Registry {
                routes: HashMap::new(),
                logger: None,
            }),
        }
    }

    /// Subscribes the hook to `logger` and binds it for later registrations.
    /// Applying again rebinds to the new logger; applying to the logger it
    /// is already bound to changes nothing.
    pub fn apply(self: &Arc<Self>, logger: &Arc<HookLogger>) {
        let mut registry = self.registry.lock().unwrap();
        let bound = registry
            .logger
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|current| Arc::ptr_eq(&current, logger));
        if !bound {
            logger.add_hook(Arc::clone(self) as Arc<dyn Hook>);
        }
        registry.logger = Some(Arc::downgrade(logger));
    }

    /// The logger this hook was last applied to, if still alive.
    pub fn logger(&self) -> Option<Arc<HookLogger>> {
        self.registry
            .lock()
            .unwrap()
            .logger
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Routes `module` to `hook`, or to this hook itself when `None`.
    ///
    /// Registering a module again replaces its route. The returned handle
    /// logs through the bound logger, or the standard logger when the hook
    /// was never applied.
    ///
    /// Routes hold their hook strongly and are never removed: two hooks
    /// registered as each other's routes keep each other alive for the rest
    /// of the process.
    pub fn add(&self, module: &str, hook: Option<Arc<RouteHook>>) -> ModuleLogger {
        let mut registry = self.registry.lock().unwrap();
        let route = match hook {
            Some(hook) if !std::ptr::eq(Arc::as_ptr(&hook), self) => Route::Table(hook),
            _ => Route::Own,
        };
        registry.routes.insert(module.into(), route);
        let logger = registry.logger.as_ref().and_then(Weak::upgrade);
        drop(registry);
        logger
            .unwrap_or_else(crate::standard_logger)
            .with_context(Context::for_module(module))
    }

    pub fn set_formatter(&self, formatter: Option<Arc<dyn Formatter>>) {
        self.table.lock().unwrap().formatter = formatter.unwrap_or_else(default_formatter);
    }

    pub fn formatter(&self) -> Arc<dyn Formatter> {
        Arc::clone(&self.table.lock().unwrap().formatter)
    }

    /// Destination for levels without one of their own.
    pub fn set_default_writer(&self, destination: Arc<dyn Destination>) {
        self.table.lock().unwrap().default_writer = Some(destination);
    }

    pub fn set_writer(&self, level: Level, destination: Arc<dyn Destination>) {
        let mut table = self.table.lock().unwrap();
        if table.writers.insert(level, destination).is_none() {
            table.levels.push(level);
            table.levels.sort();
        }
    }

    /// Where an entry at `level` would be written by this hook's own table.
    pub fn route(&self, level: Level) -> Option<Arc<dyn Destination>> {
        self.table.lock().unwrap().route(level)
    }

    /// Levels with a destination of their own, most severe first.
    pub fn bound_levels(&self) -> Vec<Level> {
        self.table.lock().unwrap().levels.clone()
    }

    /// Number of frames skipped before looking for the caller of
    /// error-grade entries.
    pub fn set_caller_skip(&self, skip: usize) {
        self.set_caller(Arc::new(SkipCaller::new(skip)));
    }

    pub fn set_caller(&self, caller: Arc<dyn Caller>) {
        self.table.lock().unwrap().caller = caller;
    }

    /// Closes every destination of the table. The first failure is
    /// returned.
    pub fn close(&self) -> io::Result<()> {
        let table = self.table.lock().unwrap();
        let mut result = Ok(());
        for destination in table.writers.values().chain(table.default_writer.iter()) {
            if let Err(err) = destination.close()
                && result.is_ok()
            {
                result = Err(err);
            }
        }
        result
    }

    /// The registered hook for the entry's module, if it is another one.
    fn find_hook(&self, context: Option<&Context>) -> Option<Arc<RouteHook>> {
        let module = match context.and_then(Context::module)? {
            ContextValue::Text(module) => module,
            ContextValue::Opaque(value) => {
                eprintln!("unsupported module tag: {value}");
                return None;
            }
        };
        match self.registry.lock().unwrap().routes.get(module)? {
            Route::Own => None,
            Route::Table(hook) => Some(Arc::clone(hook)),
        }
    }

    fn write_entry(&self, entry: &mut Entry) -> Result<(), Error> {
        let table = self.table.lock().unwrap();
        if table.is_empty() {
            return Ok(());
        }
        let Some(destination) = table.route(entry.level) else {
            return Ok(());
        };
        if entry.level.is_error_grade()
            && let Some(frame) = table.caller.frame()
        {
            entry
                .fields
                .insert(FIELD_KEY_FUNC.into(), frame.function.into());
            if let Some(line) = frame.line {
                entry.fields.insert(FIELD_KEY_LINE.into(), line.into());
            }
        }
        let bytes = table.formatter.format(entry).inspect_err(|err| {
            eprintln!("failed to generate string for entry: {err}");
        })?;
        destination.write(&bytes)?;
        Ok(())
    }
}

impl Hook for RouteHook {
    fn levels(&self) -> &[Level] {
        &Level::ALL
    }

    fn fire(&self, entry: &mut Entry) -> Result<(), Error> {
        match self.find_hook(entry.context.as_ref()) {
            Some(hook) => hook.write_entry(entry),
            None => self.write_entry(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{Discard, JsonFormatter, MemoryDestination};

    fn memory_hook(formatter: Option<Arc<dyn Formatter>>) -> (Arc<RouteHook>, MemoryDestination) {
        let memory = MemoryDestination::new();
        let hook = RouteHook::new(Output::single(memory.clone()), formatter);
        (Arc::new(hook), memory)
    }

    fn tagged(level: Level, message: &str, module: &str) -> Entry {
        Entry::new(level, message).with_module(module)
    }

    #[test]
    fn test_level_writer_then_fallback() {
        let errors = MemoryDestination::new();
        let rest = MemoryDestination::new();
        let mut writers = WriterMap::new();
        writers.insert(Level::Error, Arc::new(errors.clone()) as Arc<dyn Destination>);
        let hook = RouteHook::new(writers, None);
        hook.set_default_writer(Arc::new(rest.clone()));

        hook.fire(&mut Entry::new(Level::Error, "e")).unwrap();
        hook.fire(&mut Entry::new(Level::Info, "i")).unwrap();
        hook.fire(&mut Entry::new(Level::Debug, "d")).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(rest.len(), 2);
        assert_eq!(hook.bound_levels(), vec![Level::Error]);
    }

    #[test]
    fn test_unrouted_level_is_silent() {
        let errors = MemoryDestination::new();
        let mut writers = WriterMap::new();
        writers.insert(Level::Error, Arc::new(errors.clone()) as Arc<dyn Destination>);
        let hook = RouteHook::new(writers, None);
        assert!(hook.route(Level::Info).is_none());
        hook.fire(&mut Entry::new(Level::Info, "dropped")).unwrap();
        assert!(errors.is_empty());

        let empty = RouteHook::new(WriterMap::new(), None);
        empty.fire(&mut Entry::new(Level::Error, "dropped")).unwrap();
    }

    #[test]
    fn test_set_writer_binds_level() {
        let (hook, fallback) = memory_hook(None);
        let warnings = MemoryDestination::new();
        hook.set_writer(Level::Warn, Arc::new(warnings.clone()));
        hook.fire(&mut Entry::new(Level::Warn, "w")).unwrap();
        hook.fire(&mut Entry::new(Level::Info, "i")).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(fallback.len(), 1);
        assert_eq!(hook.bound_levels(), vec![Level::Warn]);
    }

    #[test]
    fn test_module_routing_last_registration_wins() {
        let (root, root_out) = memory_hook(None);
        let (first, first_out) = memory_hook(None);
        let (second, second_out) = memory_hook(None);
        root.add("billing", Some(first));
        root.fire(&mut tagged(Level::Info, "one", "billing")).unwrap();
        root.add("billing", Some(second));
        root.fire(&mut tagged(Level::Info, "two", "billing")).unwrap();

        assert!(root_out.is_empty());
        assert_eq!(first_out.len(), 1);
        assert_eq!(second_out.len(), 1);
        assert!(second_out.lines()[0].contains("msg=two"));
    }

    #[test]
    fn test_unregistered_or_missing_tag_uses_own_table() {
        let (root, root_out) = memory_hook(None);
        let (billing, billing_out) = memory_hook(None);
        root.add("billing", Some(billing));
        root.fire(&mut tagged(Level::Info, "x", "shipping")).unwrap();
        root.fire(&mut Entry::new(Level::Info, "y")).unwrap();
        root.fire(&mut Entry::new(Level::Info, "z").with_context(Context::new()))
            .unwrap();
        assert_eq!(root_out.len(), 3);
        assert!(billing_out.is_empty());
    }

    #[test]
    fn test_self_registration() {
        let (root, root_out) = memory_hook(None);
        root.add("audit", None);
        root.add("self", Some(Arc::clone(&root)));
        root.fire(&mut tagged(Level::Info, "a", "audit")).unwrap();
        root.fire(&mut tagged(Level::Info, "b", "self")).unwrap();
        assert_eq!(root_out.len(), 2);
    }

    #[test]
    fn test_opaque_tag_uses_own_table() {
        let (root, root_out) = memory_hook(None);
        let (billing, billing_out) = memory_hook(None);
        root.add("7", Some(billing));
        let context = Context::new().with_value(crate::CTX_KEY_NAME, ContextValue::Opaque("7".into()));
        root.fire(&mut Entry::new(Level::Info, "n").with_context(context))
            .unwrap();
        assert_eq!(root_out.len(), 1);
        assert!(billing_out.is_empty());
    }

    #[test]
    fn test_resolution_is_single_hop() {
        let (root, _) = memory_hook(None);
        let (billing, billing_out) = memory_hook(None);
        let (nested, nested_out) = memory_hook(None);
        billing.add("billing", Some(nested));
        root.add("billing", Some(billing));
        root.fire(&mut tagged(Level::Info, "hop", "billing")).unwrap();
        assert_eq!(billing_out.len(), 1);
        assert!(nested_out.is_empty());
    }

    #[test]
    fn test_caller_fields_only_for_error_grade() {
        let (hook, memory) = memory_hook(Some(Arc::new(JsonFormatter::new())));
        hook.set_caller(Arc::new(|| {
            Some(crate::Frame {
                function: "app::checkout".into(),
                file: None,
                line: Some(88),
            })
        }));
        let mut info = Entry::new(Level::Info, "fine");
        hook.fire(&mut info).unwrap();
        assert!(!info.fields.contains_key(FIELD_KEY_FUNC));
        let mut error = Entry::new(Level::Error, "broken");
        hook.fire(&mut error).unwrap();
        assert_eq!(error.fields[FIELD_KEY_FUNC], "app::checkout");
        assert_eq!(error.fields[FIELD_KEY_LINE], 88);

        let lines = memory.lines();
        let info: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        let error: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert!(info.get(FIELD_KEY_FUNC).is_none());
        assert_eq!(error[FIELD_KEY_FUNC], "app::checkout");
        assert_eq!(error[FIELD_KEY_LINE], 88);
    }

    #[test]
    fn test_stack_caller_attaches_func() {
        let (hook, _) = memory_hook(None);
        let mut entry = Entry::new(Level::Fatal, "going down");
        hook.fire(&mut entry).unwrap();
        if let Some(func) = entry.fields.get(FIELD_KEY_FUNC) {
            let func = func.as_str().unwrap();
            assert_ne!(crate::caller::package_name(func), env!("CARGO_CRATE_NAME"));
        }
    }

    struct Refusing;

    impl Formatter for Refusing {
        fn format(&self, _: &Entry) -> Result<Vec<u8>, Error> {
            Err(Error::Format("no".into()))
        }
    }

    #[test]
    fn test_format_failure_writes_nothing() {
        let (hook, memory) = memory_hook(Some(Arc::new(Refusing)));
        let err = hook.fire(&mut Entry::new(Level::Info, "x")).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(memory.is_empty());
        hook.set_formatter(None);
        hook.fire(&mut Entry::new(Level::Info, "x")).unwrap();
        assert_eq!(memory.len(), 1);
    }

    struct Full;

    impl Destination for Full {
        fn write(&self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"))
        }
    }

    #[test]
    fn test_write_error_is_returned() {
        let hook = RouteHook::new(Output::single(Full), None);
        match hook.fire(&mut Entry::new(Level::Warn, "x")) {
            Err(Error::Io(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::StorageFull);
                assert_eq!(err.to_string(), "disk full");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_add_returns_handle_on_bound_logger() {
        let logger = Arc::new(HookLogger::new());
        let (root, root_out) = memory_hook(None);
        let (billing, billing_out) = memory_hook(None);
        root.apply(&logger);
        assert!(Arc::ptr_eq(&root.logger().unwrap(), &logger));

        let billing_log = root.add("billing", Some(billing));
        assert!(Arc::ptr_eq(billing_log.logger(), &logger));
        billing_log.info("charged");
        logger.with_context(Context::new()).info("plain");
        assert_eq!(billing_out.len(), 1);
        assert!(billing_out.lines()[0].contains("msg=charged"));
        assert_eq!(root_out.len(), 1);
    }

    #[test]
    fn test_apply_twice_subscribes_once() {
        let logger = Arc::new(HookLogger::new());
        let (root, root_out) = memory_hook(None);
        root.apply(&logger);
        root.apply(&logger);
        logger.with_context(Context::new()).info("once");
        assert_eq!(root_out.len(), 1);

        let other = Arc::new(HookLogger::new());
        root.apply(&other);
        assert!(Arc::ptr_eq(&root.logger().unwrap(), &other));
        other.with_context(Context::new()).info("rebound");
        assert_eq!(root_out.len(), 2);
    }

    #[test]
    fn test_module_writes_with_its_own_formatter() {
        let (root, root_out) = memory_hook(None);
        let (billing, billing_out) = memory_hook(Some(Arc::new(JsonFormatter::new())));
        root.add("billing", Some(billing));
        root.fire(&mut tagged(Level::Info, "charged", "billing").with_field("amount", 12))
            .unwrap();
        root.fire(&mut Entry::new(Level::Info, "plain")).unwrap();

        let line: serde_json::Value = serde_json::from_str(&billing_out.lines()[0]).unwrap();
        assert_eq!(line["msg"], "charged");
        assert_eq!(line["amount"], 12);
        assert!(root_out.lines()[0].starts_with("time=\""));
        assert!(serde_json::from_str::<serde_json::Value>(&root_out.lines()[0]).is_err());
    }

    #[test]
    fn test_close_reaches_every_destination() {
        struct Counting(Arc<AtomicUsize>);
        impl Destination for Counting {
            fn write(&self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn close(&self) -> io::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let closed = Arc::new(AtomicUsize::new(0));
        let mut writers = WriterMap::new();
        writers.insert(Level::Error, Arc::new(Counting(closed.clone())) as Arc<dyn Destination>);
        let hook = RouteHook::new(writers, None);
        hook.set_default_writer(Arc::new(Counting(closed.clone())));
        hook.close().unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        let discard = RouteHook::new(Output::single(Discard), None);
        discard.close().unwrap();
    }

    /// Flags any overlap between two writes.
    #[derive(Default)]
    struct OverlapDetector {
        busy: AtomicBool,
        overlapped: AtomicBool,
        writes: AtomicUsize,
    }

    impl Destination for OverlapDetector {
        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(50));
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_concurrent_fires_do_not_interleave() {
        let detector = Arc::new(OverlapDetector::default());
        let hook = Arc::new(RouteHook::new(
            Arc::clone(&detector) as Arc<dyn Destination>,
            None,
        ));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let hook = Arc::clone(&hook);
                thread::spawn(move || {
                    for j in 0..25 {
                        if j == 10 {
                            hook.set_formatter(None);
                            hook.add(&format!("worker-{i}"), None);
                        }
                        hook.fire(&mut Entry::new(Level::Info, format!("{i}-{j}")))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(detector.writes.load(Ordering::SeqCst), 200);
        assert!(!detector.overlapped.load(Ordering::SeqCst));
    }
}
