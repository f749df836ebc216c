use std::collections::HashMap;
use std::time::Duration;

use crate::error::DbError;

/// 连接池配置
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    pub initial_pool_size: usize,  // 构造时预建的连接数
    pub max_pool_size: usize,      // 连接总数上限，0 表示不限
    pub max_idle_pool_size: usize, // 空闲连接数上限，超出即丢弃
    pub checkout_timeout: Duration,
    pub retry_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            initial_pool_size: 1,
            max_pool_size: 1,
            max_idle_pool_size: 1,
            checkout_timeout: Duration::from_secs(5),
            retry_attempts: 1,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_pool_size(mut self, n: usize) -> Self {
        self.initial_pool_size = n;
        self
    }

    pub fn max_pool_size(mut self, n: usize) -> Self {
        self.max_pool_size = n;
        self
    }

    pub fn max_idle_pool_size(mut self, n: usize) -> Self {
        self.max_idle_pool_size = n;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn retry_attempts(mut self, n: usize) -> Self {
        self.retry_attempts = n;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// 从 URL 查询参数解析池配置
    /// Recognized keys (case-sensitive): `initial_pool_size`,
    /// `max_pool_size`, `max_idle_pool_size`, `checkout_timeout`,
    /// `retry_attempts`, `retry_delay`. Unrecognized keys are left for the
    /// driver.
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, DbError> {
        let mut opts = Self::default();
        if let Some(raw) = params.get("initial_pool_size") {
            opts.initial_pool_size = parse_count("initial_pool_size", raw)?;
        }
        if let Some(raw) = params.get("max_pool_size") {
            opts.max_pool_size = parse_count("max_pool_size", raw)?;
        }
        if let Some(raw) = params.get("max_idle_pool_size") {
            opts.max_idle_pool_size = parse_count("max_idle_pool_size", raw)?;
        }
        if let Some(raw) = params.get("checkout_timeout") {
            opts.checkout_timeout = parse_seconds("checkout_timeout", raw)?;
        }
        if let Some(raw) = params.get("retry_attempts") {
            opts.retry_attempts = parse_count("retry_attempts", raw)?;
        }
        if let Some(raw) = params.get("retry_delay") {
            opts.retry_delay = parse_seconds("retry_delay", raw)?;
        }
        Ok(opts)
    }
}

fn parse_count(key: &str, raw: &str) -> Result<usize, DbError> {
    raw.parse()
        .map_err(|_| DbError::InvalidDatabaseUrl(format!("invalid value for {}: {}", key, raw)))
}

fn parse_seconds(key: &str, raw: &str) -> Result<Duration, DbError> {
    let secs: f64 = raw
        .parse()
        .map_err(|_| DbError::InvalidDatabaseUrl(format!("invalid value for {}: {}", key, raw)))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(DbError::InvalidDatabaseUrl(format!(
            "invalid value for {}: {}",
            key, raw
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}
