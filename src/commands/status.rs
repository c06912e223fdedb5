use std::fs;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::ingest::count_rows;
use crate::model::IngestRunManifest;
use crate::retrieval::value_index_status;
use crate::util::{manifest_dir, resolve_db_path};

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = manifest_dir(&args.cache_root);
    let ingest_manifest_path = manifest_dir.join("ingest_run.json");
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());

    info!(cache_root = %args.cache_root.display(), "status requested");

    if ingest_manifest_path.exists() {
        let raw = fs::read(&ingest_manifest_path)
            .with_context(|| format!("failed to read {}", ingest_manifest_path.display()))?;
        let manifest: IngestRunManifest = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", ingest_manifest_path.display()))?;

        info!(
            run_id = %manifest.run_id,
            status = %manifest.status,
            updated_at = %manifest.updated_at,
            csv = %manifest.csv_path,
            rows_inserted = manifest.rows_inserted,
            rows_skipped = manifest.rows_skipped,
            clients = manifest.client_count,
            "loaded ingest manifest"
        );
    } else {
        warn!(path = %ingest_manifest_path.display(), "ingest manifest missing");
    }

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let connection = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let transactions = count_rows(&connection, "SELECT COUNT(*) FROM transactions").unwrap_or(0);
    let clients =
        count_rows(&connection, "SELECT COUNT(DISTINCT clnt_id) FROM transactions").unwrap_or(0);

    info!(
        path = %db_path.display(),
        transactions,
        clients,
        "database status"
    );

    let index = value_index_status(&connection, &args.model_id)
        .with_context(|| format!("failed to inspect semantic index in {}", db_path.display()))?;
    if index.available {
        info!(model_id = %args.model_id, entries = index.entry_count, "semantic index ready");
    } else {
        warn!(
            model_id = %args.model_id,
            reason = %index.reason.unwrap_or_default(),
            "semantic index unavailable"
        );
    }

    Ok(())
}
