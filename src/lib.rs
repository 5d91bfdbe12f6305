//! # routelog
//! Per-module, per-level routed output for the `log` facade.
//!
//! A [`RouteHook`] sends every entry to the destination bound to its level,
//! or to a fallback destination. Modules can be registered with a hook of
//! their own: calls tagged with that module name are written through the
//! module's table and formatter instead. Error-grade entries get the function
//! and line of the application code that emitted them.
//!
//! ## Usage
//! ```toml
//! // Cargo.toml
//! ...
//! [dependencies]
//! routelog = "0.1.0"
//! ```
//!
//! ```rust
//! use std::sync::Arc;
//! use routelog::{HookLogger, MemoryDestination, Output, RouteHook};
//!
//! let logger = Arc::new(HookLogger::new());
//! let main_out = MemoryDestination::new();
//! let billing_out = MemoryDestination::new();
//!
//! let root = Arc::new(RouteHook::new(Output::single(main_out.clone()), None));
//! root.apply(&logger);
//! let billing_hook = RouteHook::new(Output::single(billing_out.clone()), None);
//! let billing = root.add("billing", Some(Arc::new(billing_hook)));
//!
//! billing.info("invoice sent");
//! logger.with_module("shipping").warn("parcel late");
//! assert_eq!(billing_out.len(), 1);
//! assert_eq!(main_out.len(), 1);
//! ```
//!
//! ## Through the `log` macros
//! The standard logger can be installed as the facade backend. A
//! `moduleName` key-value routes a single call.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! routelog::init_global().unwrap();
//! routelog::set_default_writer(Arc::new(routelog::Stdout));
//! routelog::set_formatter(Some(routelog::pick_formatter(false)));
//!
//! log::info!("Hello, world!");
//! log::error!(moduleName = "billing"; "charge failed");
//! ```
//!
//! ## Rotating files
//! One rotating file per level, named `{base}.{level}.{timestamp}`, with
//! `{base}.{level}` kept as a symlink to the newest file.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use routelog::{RotateFileMap, RouteHook};
//!
//! let files = RotateFileMap::new("/var/log/app/app.log").expect("Unable to open log files");
//! let hook = Arc::new(RouteHook::new(files, None));
//! hook.apply(&routelog::standard_logger());
//! ```

pub mod caller;
mod config;
mod destination;
mod entry;
mod error;
mod exported;
mod formatter;
mod hook;
mod level;
mod logger;
mod rotate_file;

pub use caller::{Caller, Frame, PredicateCaller, SkipCaller};
pub use config::{ROUTELOG_CONFIG, RouteLogConfig};
pub use destination::{
    Destination, Discard, LogFile, MemoryDestination, Stdout, Tee, WriterDestination,
};
pub use entry::{CTX_KEY_NAME, Context, ContextValue, Entry, Fields, ModuleLogger};
pub use error::Error;
pub use exported::{
    add, apply, formatter, hook, init_global, pick_formatter, set_default_writer, set_formatter,
    set_hook, set_level, standard_logger,
};
pub use formatter::{
    DEFAULT_TIMESTAMP_FORMAT, Formatter, JsonFormatter, TextFormatter, default_formatter,
    dev_formatter,
};
pub use hook::{FIELD_KEY_FUNC, FIELD_KEY_LINE, Output, RouteHook, WriterMap};
pub use level::{Level, ParseLevelError};
pub use logger::{Hook, HookLogger, LevelHooks, entry_from_record};
pub use rotate_file::{
    Clock, DEFAULT_PATTERN, ManualClock, RotateFile, RotateFileConfig, RotateFileMap, SystemClock,
};
