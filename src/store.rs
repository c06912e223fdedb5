use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};

use crate::model::{QueryRows, ScalarValue};

const MAX_IDLE_CONNECTIONS: usize = 8;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("statement failed: {message}")]
    Statement { message: String },
}

/// Relational store consumed by the query gateway and the evaluation engine.
pub trait RelationalStore: Send + Sync {
    fn execute(&self, sql: &str) -> Result<QueryRows, StoreError>;

    /// Compiles the statement without stepping it.
    fn check_syntax(&self, sql: &str) -> Result<(), StoreError>;
}

/// Read-only SQLite connections shared by concurrent workers. Connections are opened lazily
/// and parked after use; nothing is ever written through them.
pub struct ReadOnlyPool {
    db_path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReadOnlyPool {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn with_connection<T>(
        &self,
        operation: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let connection = self.checkout()?;
        let result = operation(&connection).map_err(|err| StoreError::Statement {
            message: err.to_string(),
        });
        self.checkin(connection);
        result
    }

    fn checkout(&self) -> Result<Connection, StoreError> {
        let parked = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if let Some(connection) = parked {
            return Ok(connection);
        }

        open_read_only(&self.db_path)
    }

    fn checkin(&self, connection: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(connection);
        }
    }
}

fn open_read_only(db_path: &Path) -> Result<Connection, StoreError> {
    if !db_path.exists() {
        return Err(StoreError::Unavailable {
            reason: format!("database file missing: {}", db_path.display()),
        });
    }

    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|err| StoreError::Unavailable {
        reason: format!(
            "failed to open database read-only: {}: {err}",
            db_path.display()
        ),
    })?;

    connection
        .pragma_update(None, "query_only", "ON")
        .map_err(|err| StoreError::Unavailable {
            reason: format!("failed to set query_only: {err}"),
        })?;

    Ok(connection)
}

pub struct SqliteStore {
    pool: ReadOnlyPool,
}

impl SqliteStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Self {
        Self {
            pool: ReadOnlyPool::new(db_path),
        }
    }
}

impl RelationalStore for SqliteStore {
    fn execute(&self, sql: &str) -> Result<QueryRows, StoreError> {
        self.pool
            .with_connection(|connection| run_statement(connection, sql))
    }

    fn check_syntax(&self, sql: &str) -> Result<(), StoreError> {
        self.pool
            .with_connection(|connection| connection.prepare(sql).map(|_| ()))
    }
}

fn run_statement(connection: &Connection, sql: &str) -> rusqlite::Result<QueryRows> {
    let mut statement = connection.prepare(sql)?;
    let columns = statement
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<String>>();

    let mut rows = statement.query([])?;
    let mut out = Vec::<Vec<ScalarValue>>::new();
    while let Some(row) = rows.next()? {
        out.push(read_row(row, columns.len())?);
    }

    Ok(QueryRows { columns, rows: out })
}

fn read_row(row: &Row<'_>, width: usize) -> rusqlite::Result<Vec<ScalarValue>> {
    let mut values = Vec::with_capacity(width);
    for index in 0..width {
        let value = match row.get_ref(index)? {
            ValueRef::Null => ScalarValue::Null,
            ValueRef::Integer(value) => ScalarValue::Integer(value),
            ValueRef::Real(value) => ScalarValue::Real(value),
            ValueRef::Text(bytes) => ScalarValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => ScalarValue::Text(
                bytes
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect::<String>(),
            ),
        };
        values.push(value);
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use rusqlite::{Connection, params};

    use crate::commands::ingest::ensure_transactions_schema;

    pub(crate) struct SeedTransaction {
        pub clnt_id: i64,
        pub txn_id: i64,
        pub txn_date: &'static str,
        pub desc: &'static str,
        pub merchant: Option<&'static str>,
        pub cat: &'static str,
        pub amt: f64,
    }

    pub(crate) fn seed_transactions() -> Vec<SeedTransaction> {
        vec![
            SeedTransaction {
                clnt_id: 42,
                txn_id: 114224,
                txn_date: "01/08/2023 0:00",
                desc: "McDonald's",
                merchant: Some("MCDONALD'S"),
                cat: "Restaurants",
                amt: -2.22,
            },
            SeedTransaction {
                clnt_id: 42,
                txn_id: 46120,
                txn_date: "03/08/2023 0:00",
                desc: "Debit Purchase",
                merchant: None,
                cat: "Restaurants",
                amt: -3.29,
            },
            SeedTransaction {
                clnt_id: 42,
                txn_id: 50001,
                txn_date: "10/08/2023 0:00",
                desc: "Grocery Outlet",
                merchant: Some("GROCERY"),
                cat: "Supermarkets and Groceries",
                amt: -120.5,
            },
            SeedTransaction {
                clnt_id: 42,
                txn_id: 50002,
                txn_date: "15/08/2023 0:00",
                desc: "Payroll Deposit",
                merchant: None,
                cat: "Paychecks",
                amt: 2500.0,
            },
            SeedTransaction {
                clnt_id: 42,
                txn_id: 50003,
                txn_date: "02/09/2023 0:00",
                desc: "ATM Withdrawal",
                merchant: None,
                cat: "ATM",
                amt: -60.0,
            },
            SeedTransaction {
                clnt_id: 77,
                txn_id: 90001,
                txn_date: "05/08/2023 0:00",
                desc: "Starbucks",
                merchant: Some("STARBUCKS"),
                cat: "Coffee Shops",
                amt: -4.75,
            },
        ]
    }

    pub(crate) fn create_seeded_db(path: &Path) {
        let connection = Connection::open(path).expect("open seed db");
        ensure_transactions_schema(&connection).expect("schema");
        for seed in seed_transactions() {
            connection
                .execute(
                    "
                    INSERT INTO transactions(clnt_id, bank_id, acc_id, txn_id, txn_date, \"desc\", merchant, cat, amt)
                    VALUES(?1, 1, 10, ?2, ?3, ?4, ?5, ?6, ?7)
                    ",
                    params![
                        seed.clnt_id,
                        seed.txn_id,
                        seed.txn_date,
                        seed.desc,
                        seed.merchant,
                        seed.cat,
                        seed.amt
                    ],
                )
                .expect("insert seed row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::create_seeded_db;
    use super::*;

    #[test]
    fn execute_returns_columns_and_typed_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("store.sqlite");
        create_seeded_db(&db_path);

        let store = SqliteStore::open(&db_path);
        let rows = store
            .execute("SELECT txn_id, merchant, amt FROM transactions WHERE clnt_id = 42 ORDER BY txn_id LIMIT 1")
            .expect("query should run");

        assert_eq!(rows.columns, vec!["txn_id", "merchant", "amt"]);
        assert_eq!(
            rows.rows,
            vec![vec![
                ScalarValue::Integer(46120),
                ScalarValue::Null,
                ScalarValue::Real(-3.29)
            ]]
        );
    }

    #[test]
    fn connections_refuse_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("store.sqlite");
        create_seeded_db(&db_path);

        let store = SqliteStore::open(&db_path);
        let err = store
            .execute("DELETE FROM transactions")
            .expect_err("read-only connection must refuse writes");
        assert!(matches!(err, StoreError::Statement { .. }));

        let remaining = store
            .execute("SELECT COUNT(*) FROM transactions")
            .expect("count");
        assert_eq!(remaining.rows[0][0], ScalarValue::Integer(6));
    }

    #[test]
    fn missing_database_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("absent.sqlite"));
        assert!(matches!(
            store.execute("SELECT 1"),
            Err(StoreError::Unavailable { .. })
        ));
    }

    #[test]
    fn check_syntax_flags_malformed_sql_without_running_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("store.sqlite");
        create_seeded_db(&db_path);

        let store = SqliteStore::open(&db_path);
        assert!(store.check_syntax("SELECT SUM(amt) FROM transactions").is_ok());
        assert!(store.check_syntax("SELEC amt FROM transactions").is_err());
        assert!(store.check_syntax("SELECT nope FROM transactions").is_err());
    }
}
