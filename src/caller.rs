//! Caller resolution.
//!
//! Walks the current stack and returns the first frame that belongs neither
//! to this crate nor to the `log` facade, so error-grade entries can point at
//! the application code that emitted them.

use std::{
    fmt,
    path::PathBuf,
    sync::{Arc, OnceLock},
};

/// Upper bound on frames inspected past the resolver entry point.
pub const MAX_CALLER_DEPTH: usize = 32;

/// Default skip depth: the resolver entry point and the strategy frame that
/// called it. Every frame after those is ours until the host facility hands
/// over to the application. Tune with `RouteHook::set_caller_skip` or
/// `ROUTELOG_CALLER_SKIP`.
pub const KNOWN_RESOLVER_FRAMES: usize = 2;

/// Namespaces of the host logging facility, treated as internal.
pub const HOST_NAMESPACES: &[&str] = &["log"];

/// Marks depth 0 of a walk.
const ENTRY_POINT: &str = "::caller::resolve";

/// Namespace of this crate, found on the first walk.
static OWN_PACKAGE: OnceLock<String> = OnceLock::new();

/// One stack activation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: String,
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.function)?;
        if let Some(file) = &self.file {
            write!(f, " ({}", file.display())?;
            if let Some(line) = self.line {
                write!(f, ":{line}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Produces the frame an entry should be attributed to.
pub trait Caller: Send + Sync {
    fn frame(&self) -> Option<Frame>;
}

/// Closures returning a frame are strategies of their own, for call paths
/// whose stack shape the built-in walks cannot predict.
impl<F> Caller for F
where
    F: Fn() -> Option<Frame> + Send + Sync,
{
    fn frame(&self) -> Option<Frame> {
        self()
    }
}

/// Walks from a fixed depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipCaller {
    skip: usize,
}

impl SkipCaller {
    pub fn new(skip: usize) -> Self {
        Self { skip }
    }

    pub fn skip(&self) -> usize {
        self.skip
    }
}

impl Default for SkipCaller {
    fn default() -> Self {
        Self::new(KNOWN_RESOLVER_FRAMES)
    }
}

impl Caller for SkipCaller {
    fn frame(&self) -> Option<Frame> {
        resolve(self.skip, None)
    }
}

/// Walks from the first frame whose symbol satisfies a predicate, or from
/// `skip` when none does.
#[derive(Clone)]
pub struct PredicateCaller {
    skip: usize,
    predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
}

impl PredicateCaller {
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            skip: KNOWN_RESOLVER_FRAMES,
            predicate: Arc::new(predicate),
        }
    }

    pub fn with_skip(self, skip: usize) -> Self {
        Self { skip, ..self }
    }
}

impl fmt::Debug for PredicateCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateCaller")
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

impl Caller for PredicateCaller {
    fn frame(&self) -> Option<Frame> {
        resolve(self.skip, Some(&*self.predicate))
    }
}

/// Reduces a fully-qualified Rust symbol to the crate it lives in.
///
/// `routelog::hook::RouteHook::fire` and
/// `<routelog::logger::HookLogger as log::Log>::log` both reduce to
/// `routelog`.
pub fn package_name(function: &str) -> &str {
    let mut name = function.trim_start();
    loop {
        let stripped = name
            .trim_start_matches('<')
            .trim_start_matches('&')
            .trim_start_matches("mut ")
            .trim_start_matches("dyn ")
            .trim_start_matches("*const ")
            .trim_start_matches("*mut ");
        if stripped.len() == name.len() {
            break;
        }
        name = stripped;
    }
    let end = name
        .find(|c: char| c == ':' || c == '<' || c == ' ' || c == '>')
        .unwrap_or(name.len());
    &name[..end]
}

/// Namespace of the resolver, cached on first use.
pub fn own_package() -> &'static str {
    OWN_PACKAGE.get_or_init(|| {
        let frames = capture();
        frames
            .iter()
            .find(|frame| frame.function.ends_with(ENTRY_POINT))
            .map(|frame| package_name(&frame.function).to_string())
            .unwrap_or_else(|| env!("CARGO_CRATE_NAME").to_string())
    })
}

fn is_internal(function: &str, own: &str) -> bool {
    let package = package_name(function);
    package == own || HOST_NAMESPACES.contains(&package)
}

/// Captures the stack, symbolised, innermost first. Inlined calls show up as
/// frames of their own.
fn capture() -> Vec<Frame> {
    // Frames of the unwinder itself sit above the entry point.
    let limit = MAX_CALLER_DEPTH * 2;
    let mut frames = Vec::with_capacity(limit);
    backtrace::trace(|raw| {
        let before = frames.len();
        backtrace::resolve_frame(raw, |symbol| {
            frames.push(Frame {
                function: symbol
                    .name()
                    .map(|name| format!("{name:#}"))
                    .unwrap_or_default(),
                file: symbol.filename().map(PathBuf::from),
                line: symbol.lineno(),
            });
        });
        if frames.len() == before {
            frames.push(Frame {
                function: String::new(),
                file: None,
                line: None,
            });
        }
        frames.len() < limit
    });
    frames
}

/// Returns the first frame, at depth `skip` or beyond, outside this crate
/// and the host facility.
///
/// Depth 0 is this function. With a predicate, the walk starts at the first
/// frame whose symbol satisfies it instead.
pub fn resolve(skip: usize, predicate: Option<&dyn Fn(&str) -> bool>) -> Option<Frame> {
    let own = own_package();
    let frames = capture();
    let base = frames
        .iter()
        .position(|frame| frame.function.ends_with(ENTRY_POINT))
        .or_else(|| {
            frames
                .iter()
                .position(|frame| package_name(&frame.function) == own)
        })
        .unwrap_or(0);
    let end = frames.len().min(base + MAX_CALLER_DEPTH);
    let frames = &frames[base..end];

    let mut skip = skip;
    if let Some(predicate) = predicate
        && let Some(depth) = frames.iter().position(|frame| predicate(&frame.function))
    {
        skip = depth;
    }

    frames
        .iter()
        .skip(skip)
        .find(|frame| !frame.function.is_empty() && !is_internal(&frame.function, own))
        .cloned()
}
