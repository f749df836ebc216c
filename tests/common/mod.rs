#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use udbc::driver::{Connection, Driver, ExecResult, ResultSet, Statement};
use udbc::error::DbError;
use udbc::value::{ColumnType, Value};
use udbc::Database;

/// Observable state shared between a registered test driver and the test
/// that registered it.
#[derive(Default)]
pub struct DriverProbe {
    pub connections_built: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub statements_built: AtomicUsize,
    pub execs: AtomicUsize,
    fail_script: Mutex<VecDeque<DbError>>,
}

impl DriverProbe {
    /// Queue an error; the next statement execution consumes and returns it.
    pub fn fail_next(&self, err: DbError) {
        self.fail_script.lock().unwrap().push_back(err);
    }

    fn next_failure(&self) -> Option<DbError> {
        self.fail_script.lock().unwrap().pop_front()
    }

    pub fn built(&self) -> usize {
        self.connections_built.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.connections_closed.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> usize {
        self.statements_built.load(Ordering::SeqCst)
    }
}

/// In-memory driver serving a fixed two-row result for any query, or no rows
/// for queries containing "empty".
pub struct MemoryDriver {
    scheme: String,
    probe: Arc<DriverProbe>,
}

impl MemoryDriver {
    pub fn new(scheme: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            probe: Arc::new(DriverProbe::default()),
        }
    }
}

/// Register a fresh in-memory driver under `scheme` and return its probe.
/// Each test registers its own scheme; the registry is process-global.
pub fn register_memory_driver(scheme: &str) -> Arc<DriverProbe> {
    let driver = MemoryDriver::new(scheme);
    let probe = driver.probe.clone();
    udbc::register(driver);
    probe
}

#[async_trait]
impl Driver for MemoryDriver {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn build_connection(&self, _db: &Database) -> Result<Arc<dyn Connection>, DbError> {
        self.probe.connections_built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            probe: self.probe.clone(),
            valid: AtomicBool::new(true),
        }))
    }
}

pub struct MemoryConnection {
    probe: Arc<DriverProbe>,
    valid: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn build_statement(&self, query: &str) -> Result<Arc<dyn Statement>, DbError> {
        self.probe.statements_built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryStatement {
            query: query.to_string(),
            probe: self.probe.clone(),
        }))
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), DbError> {
        self.probe.connections_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemoryStatement {
    query: String,
    probe: Arc<DriverProbe>,
}

#[async_trait]
impl Statement for MemoryStatement {
    async fn query(&self, _args: &[Value]) -> Result<Box<dyn ResultSet>, DbError> {
        if let Some(err) = self.probe.next_failure() {
            return Err(err);
        }
        let rows = if self.query.contains("empty") {
            Vec::new()
        } else {
            vec![
                vec![Value::I64(1), Value::Str("one".into())],
                vec![Value::I64(2), Value::Str("two".into())],
            ]
        };
        Ok(Box::new(MemoryResultSet { rows, row: None }))
    }

    async fn exec(&self, _args: &[Value]) -> Result<ExecResult, DbError> {
        if let Some(err) = self.probe.next_failure() {
            return Err(err);
        }
        self.probe.execs.fetch_add(1, Ordering::SeqCst);
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: 1,
        })
    }

    async fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

pub struct MemoryResultSet {
    rows: Vec<Vec<Value>>,
    row: Option<usize>,
}

const COLUMNS: [&str; 2] = ["id", "name"];

#[async_trait]
impl ResultSet for MemoryResultSet {
    async fn move_next(&mut self) -> Result<bool, DbError> {
        let next = self.row.map_or(0, |i| i + 1);
        if next < self.rows.len() {
            self.row = Some(next);
            Ok(true)
        } else {
            self.row = Some(self.rows.len());
            Ok(false)
        }
    }

    fn column_count(&self) -> usize {
        COLUMNS.len()
    }

    fn column_name(&self, idx: usize) -> &str {
        COLUMNS[idx]
    }

    fn column_type(&self, idx: usize) -> ColumnType {
        match idx {
            0 => ColumnType::BigInt,
            _ => ColumnType::Text,
        }
    }

    fn value(&self, idx: usize) -> Result<Value, DbError> {
        let row = self
            .row
            .filter(|i| *i < self.rows.len())
            .ok_or_else(|| DbError::General("cursor not positioned on a row".into()))?;
        self.rows[row]
            .get(idx)
            .cloned()
            .ok_or_else(|| DbError::General(format!("no column {}", idx)))
    }

    async fn close(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}
