pub mod database;
pub mod driver;
pub mod error;
pub mod options;
pub mod pool;
pub mod registry;
pub mod rows;
pub mod statement;
pub mod value;

pub use database::Database;
pub use driver::{Connection, Driver, ExecResult, ResultSet, Statement};
pub use error::DbError;
pub use options::PoolOptions;
pub use registry::{open, register};
pub use rows::{FromRow, Row, Rows};
pub use statement::PoolStatement;
pub use value::{ColumnType, DriverValue, FromValue, Value};
