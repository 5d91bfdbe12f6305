//! Process-wide defaults: a standard logger and a default hook applied to it.

use std::sync::{Arc, LazyLock, RwLock};

use crate::{
    Destination, Discard, Formatter, HookLogger, Level, ModuleLogger, Output, RouteHook,
    default_formatter, dev_formatter,
};

static STANDARD_LOGGER: LazyLock<Arc<HookLogger>> = LazyLock::new(|| Arc::new(HookLogger::new()));

/// Discards everything until a writer is configured.
static HOOK: LazyLock<RwLock<Arc<RouteHook>>> = LazyLock::new(|| {
    let hook = Arc::new(RouteHook::new(Output::single(Discard), Some(dev_formatter())));
    hook.apply(&STANDARD_LOGGER);
    RwLock::new(hook)
});

/// The logger behind `log::info!` and friends once [`init_global`] ran.
pub fn standard_logger() -> Arc<HookLogger> {
    Arc::clone(&STANDARD_LOGGER)
}

/// Installs the standard logger, with the default hook applied, as the `log`
/// facade backend.
pub fn init_global() -> Result<(), log::SetLoggerError> {
    LazyLock::force(&HOOK);
    log::set_logger(&**STANDARD_LOGGER)?;
    log::set_max_level(STANDARD_LOGGER.level().to_level_filter());
    Ok(())
}

/// Sets the standard logger level and the facade filter together.
pub fn set_level(level: Level) {
    STANDARD_LOGGER.set_level(level);
    log::set_max_level(level.to_level_filter());
}

/// The current default hook.
pub fn hook() -> Arc<RouteHook> {
    Arc::clone(&HOOK.read().unwrap())
}

/// Replaces the default hook used by the free functions of this module. The
/// new hook is not applied to any logger.
pub fn set_hook(hook: Arc<RouteHook>) {
    *HOOK.write().unwrap() = hook;
}

/// `dev_formatter()` when `is_dev`, else `default_formatter()`.
pub fn pick_formatter(is_dev: bool) -> Arc<dyn Formatter> {
    if is_dev {
        dev_formatter()
    } else {
        default_formatter()
    }
}

pub fn add(module: &str, route: Option<Arc<RouteHook>>) -> ModuleLogger {
    hook().add(module, route)
}

pub fn apply(logger: &Arc<HookLogger>) {
    hook().apply(logger)
}

pub fn set_formatter(formatter: Option<Arc<dyn Formatter>>) {
    hook().set_formatter(formatter)
}

pub fn formatter() -> Arc<dyn Formatter> {
    hook().formatter()
}

pub fn set_default_writer(destination: Arc<dyn Destination>) {
    hook().set_default_writer(destination)
}
