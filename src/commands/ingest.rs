use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Read;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::cli::IngestArgs;
use crate::model::IngestRunManifest;
use crate::util::{
    ensure_directory, manifest_dir, now_utc_string, resolve_db_path, sha256_file,
    utc_compact_string, write_json_pretty,
};

const REQUIRED_COLUMNS: [&str; 9] = [
    "clnt_id", "bank_id", "acc_id", "txn_id", "txn_date", "desc", "merchant", "cat", "amt",
];
const MAX_ROW_WARNINGS: usize = 20;

#[derive(Debug, Default)]
pub(crate) struct IngestStats {
    pub(crate) rows_read: usize,
    pub(crate) rows_inserted: usize,
    pub(crate) rows_skipped: usize,
    pub(crate) client_count: usize,
    pub(crate) warnings: Vec<String>,
}

#[derive(Debug)]
struct TransactionRow {
    clnt_id: i64,
    bank_id: Option<i64>,
    acc_id: Option<i64>,
    txn_id: i64,
    txn_date: Option<String>,
    desc: Option<String>,
    merchant: Option<String>,
    cat: Option<String>,
    amt: f64,
}

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("ingest-{}", utc_compact_string(started_ts));

    let manifest_dir = manifest_dir(&args.cache_root);
    ensure_directory(&manifest_dir)?;
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let ingest_manifest_path = args
        .ingest_manifest_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join("ingest_run.json"));

    info!(csv = %args.csv_path.display(), db = %db_path.display(), run_id = %run_id, "starting ingest");

    let csv_sha256 = sha256_file(&args.csv_path)?;
    let file = File::open(&args.csv_path)
        .with_context(|| format!("failed to open {}", args.csv_path.display()))?;

    let mut connection = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;

    let stats = load_transactions_csv(&mut connection, file)
        .with_context(|| format!("failed to ingest {}", args.csv_path.display()))?;

    for warning in &stats.warnings {
        warn!(warning = %warning, "ingest warning");
    }

    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id,
        status: "completed".to_string(),
        started_at,
        updated_at: now_utc_string(),
        csv_path: args.csv_path.display().to_string(),
        csv_sha256,
        db_path: db_path.display().to_string(),
        rows_read: stats.rows_read,
        rows_inserted: stats.rows_inserted,
        rows_skipped: stats.rows_skipped,
        client_count: stats.client_count,
        warnings: stats.warnings,
    };
    write_json_pretty(&ingest_manifest_path, &manifest)?;

    info!(
        path = %ingest_manifest_path.display(),
        rows_inserted = manifest.rows_inserted,
        rows_skipped = manifest.rows_skipped,
        clients = manifest.client_count,
        "ingest completed"
    );

    Ok(())
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub(crate) fn ensure_transactions_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS transactions (
              clnt_id INTEGER NOT NULL,
              bank_id INTEGER,
              acc_id INTEGER,
              txn_id INTEGER NOT NULL,
              txn_date TEXT,
              \"desc\" TEXT,
              merchant TEXT,
              cat TEXT,
              amt REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_client ON transactions(clnt_id);
            CREATE INDEX IF NOT EXISTS idx_transactions_client_date ON transactions(clnt_id, txn_date);
            ",
        )
        .context("failed to initialize transactions schema")?;

    Ok(())
}

/// Headers become lowercase snake_case: non-alphanumerics turn into `_`, runs collapse,
/// and leading or trailing underscores are dropped.
pub(crate) fn clean_column_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Replaces the `transactions` table with the rows of `reader` in a single transaction.
pub(crate) fn load_transactions_csv<R: Read>(
    connection: &mut Connection,
    reader: R,
) -> Result<IngestStats> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .context("failed to read csv header row")?
        .iter()
        .map(clean_column_name)
        .collect::<Vec<String>>();

    let mut column_index = BTreeMap::<&str, usize>::new();
    for column in REQUIRED_COLUMNS {
        let Some(index) = headers.iter().position(|header| header == column) else {
            bail!(
                "csv is missing required column '{column}' (found: {})",
                headers.join(", ")
            );
        };
        column_index.insert(column, index);
    }

    let mut stats = IngestStats::default();
    let mut clients = HashSet::<i64>::new();

    let tx = connection.transaction()?;
    tx.execute("DROP TABLE IF EXISTS transactions", [])
        .context("failed to drop previous transactions table")?;
    ensure_transactions_schema(&tx)?;

    {
        let mut statement = tx.prepare(
            "
            INSERT INTO transactions(clnt_id, bank_id, acc_id, txn_id, txn_date, \"desc\", merchant, cat, amt)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )?;

        for (line, record) in csv_reader.records().enumerate() {
            stats.rows_read += 1;
            let row = match record
                .context("malformed csv record")
                .and_then(|record| parse_row(&record, &column_index))
            {
                Ok(row) => row,
                Err(err) => {
                    stats.rows_skipped += 1;
                    if stats.warnings.len() < MAX_ROW_WARNINGS {
                        stats.warnings.push(format!("row {}: {err:#}", line + 2));
                    }
                    continue;
                }
            };

            statement.execute(params![
                row.clnt_id,
                row.bank_id,
                row.acc_id,
                row.txn_id,
                row.txn_date,
                row.desc,
                row.merchant,
                row.cat,
                row.amt
            ])?;
            clients.insert(row.clnt_id);
            stats.rows_inserted += 1;
        }
    }

    tx.commit()?;

    if stats.rows_skipped > MAX_ROW_WARNINGS {
        stats.warnings.push(format!(
            "{} further rows skipped without detail",
            stats.rows_skipped - MAX_ROW_WARNINGS
        ));
    }
    stats.client_count = clients.len();

    Ok(stats)
}

fn parse_row(record: &csv::StringRecord, column_index: &BTreeMap<&str, usize>) -> Result<TransactionRow> {
    let field = |column: &str| -> Option<&str> {
        column_index
            .get(column)
            .and_then(|index| record.get(*index))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let text = |column: &str| field(column).map(ToString::to_string);

    let Some(clnt_id) = field("clnt_id").and_then(parse_integer) else {
        bail!("clnt_id is missing or not an integer");
    };
    let Some(txn_id) = field("txn_id").and_then(parse_integer) else {
        bail!("txn_id is missing or not an integer");
    };
    let Some(amt) = field("amt").and_then(|value| value.replace(',', "").parse::<f64>().ok())
    else {
        bail!("amt is missing or not a number");
    };

    Ok(TransactionRow {
        clnt_id,
        bank_id: field("bank_id").and_then(parse_integer),
        acc_id: field("acc_id").and_then(parse_integer),
        txn_id,
        txn_date: text("txn_date"),
        desc: text("desc"),
        merchant: text("merchant"),
        cat: text("cat"),
        amt,
    })
}

// Exports sometimes write integer ids as `880.0`.
fn parse_integer(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        value
            .parse::<f64>()
            .ok()
            .filter(|number| number.fract() == 0.0 && number.is_finite())
            .map(|number| number as i64)
    })
}

pub(crate) fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CSV: &str = "\
Clnt ID,Bank ID,Acc ID,Txn ID,Txn Date,Desc,Amt,Cat,Merchant
880,1,10,114224,05/08/2023 0:00,McDonald's,-2.22,Restaurants,McDonald's
880,1,10,46120,07/08/2023 0:00,Debit Purchase,-3.29,Shops,
881,2,11,70000,09/08/2023 0:00,Payroll,\"2,500.00\",Paychecks,
abc,1,10,1,01/01/2023 0:00,Broken,-1.00,Shops,
";

    #[test]
    fn clean_column_name_normalizes_headers() {
        assert_eq!(clean_column_name(" Clnt ID "), "clnt_id");
        assert_eq!(clean_column_name("Txn--Date"), "txn_date");
        assert_eq!(clean_column_name("__Amt__"), "amt");
        assert_eq!(clean_column_name("desc"), "desc");
    }

    #[test]
    fn load_transactions_csv_inserts_rows_and_skips_invalid_ones() {
        let mut connection = Connection::open_in_memory().expect("open");
        let stats =
            load_transactions_csv(&mut connection, SAMPLE_CSV.as_bytes()).expect("ingest");

        assert_eq!(stats.rows_read, 4);
        assert_eq!(stats.rows_inserted, 3);
        assert_eq!(stats.rows_skipped, 1);
        assert_eq!(stats.client_count, 2);
        assert_eq!(stats.warnings.len(), 1);

        let merchant: Option<String> = connection
            .query_row(
                "SELECT merchant FROM transactions WHERE txn_id = 46120",
                [],
                |row| row.get(0),
            )
            .expect("row");
        assert_eq!(merchant, None);

        let payroll: f64 = connection
            .query_row(
                "SELECT amt FROM transactions WHERE txn_id = 70000",
                [],
                |row| row.get(0),
            )
            .expect("row");
        assert_eq!(payroll, 2500.0);
    }

    #[test]
    fn reingest_replaces_previous_rows() {
        let mut connection = Connection::open_in_memory().expect("open");
        load_transactions_csv(&mut connection, SAMPLE_CSV.as_bytes()).expect("first ingest");
        load_transactions_csv(&mut connection, SAMPLE_CSV.as_bytes()).expect("second ingest");

        assert_eq!(
            count_rows(&connection, "SELECT COUNT(*) FROM transactions").expect("count"),
            3
        );
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let mut connection = Connection::open_in_memory().expect("open");
        let err = load_transactions_csv(&mut connection, "clnt_id,amt\n1,2\n".as_bytes())
            .expect_err("missing columns must fail");
        assert!(err.to_string().contains("bank_id"));
    }
}
