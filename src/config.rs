use std::sync::LazyLock;

use derive_from_env::FromEnv;

/// Process-wide defaults, read once from `ROUTELOG_*` environment variables.
#[derive(FromEnv)]
#[from_env(prefix = "ROUTELOG")]
#[allow(non_snake_case)]
pub struct RouteLogConfig {
    /// Skip depth of the default caller strategy.
    #[from_env(default = "2")]
    pub CALLER_SKIP: u64,
    /// Retention window of rotating files.
    #[from_env(default = "168")]
    pub MAX_AGE_HOURS: u64,
    /// Rotation interval of rotating files.
    #[from_env(default = "24")]
    pub ROTATION_HOURS: u64,
}

pub static ROUTELOG_CONFIG: LazyLock<RouteLogConfig> =
    LazyLock::new(|| RouteLogConfig::from_env().unwrap());
