pub mod config;

use std::fmt;

pub type Result<T> = core::result::Result<T, ServeError>;

/// Which limit a tenant ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitReason {
    Concurrency,
    Tokens,
}

impl LimitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitReason::Concurrency => "concurrency",
            LimitReason::Tokens => "tokens",
        }
    }
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(thiserror::Error, Debug)]
pub enum ServeError {
    #[error("rate limited: tenant {tenant} exceeded its {reason} budget")]
    RateLimited { tenant: String, reason: LimitReason },
    #[error("queue full: {limit} requests already in flight")]
    QueueFull { limit: usize },
    #[error("scheduler is not running")]
    SchedulerStopped,
    #[error("backend: {0}")]
    Backend(String),
    #[error("decode strategy {0} is not available")]
    PluginUnavailable(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
