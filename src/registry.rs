use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use url::Url;

use crate::database::Database;
use crate::driver::Driver;
use crate::error::DbError;

// 全局单例（Rust 1.80+ 推荐）
static DRIVERS: LazyLock<DriverRegistry> = LazyLock::new(DriverRegistry::new);

/// 数据库驱动注册表
/// Process-wide scheme -> driver mapping. Registration is additive and safe
/// from concurrent tasks.
pub struct DriverRegistry {
    drivers: DashMap<String, Arc<dyn Driver>>,
}

/// 获取全局注册表实例
pub fn registry() -> &'static DriverRegistry {
    &DRIVERS
}

/// 注册数据库驱动（按 scheme）
pub fn register(driver: impl Driver + 'static) {
    registry().register(driver);
}

/// Open a database from a URL; the scheme picks the driver.
pub async fn open(url: &str) -> Result<Database, DbError> {
    registry().open(url).await
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: DashMap::new(),
        }
    }

    pub fn register(&self, driver: impl Driver + 'static) {
        self.drivers
            .insert(driver.scheme().to_string(), Arc::new(driver));
    }

    /// Register an existing driver under an additional scheme (aliases such
    /// as `postgres` / `postgresql`).
    pub fn register_under(&self, scheme: &str, driver: Arc<dyn Driver>) {
        self.drivers.insert(scheme.to_string(), driver);
    }

    pub fn lookup(&self, scheme: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(scheme).map(|v| v.value().clone())
    }

    /// Parse `url`, look up its scheme, ask the driver for pool options and
    /// construct a [`Database`] with a warmed pool.
    pub async fn open(&self, url: &str) -> Result<Database, DbError> {
        let uri = Url::parse(url)
            .map_err(|e| DbError::InvalidDatabaseUrl(format!("{}: {}", url, e)))?;
        let driver = self
            .lookup(uri.scheme())
            .ok_or_else(|| DbError::UnknownScheme(uri.scheme().to_string()))?;
        let params: HashMap<String, String> = uri
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let options = driver.pool_options(&params)?;
        Database::new(driver, uri, options).await
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
