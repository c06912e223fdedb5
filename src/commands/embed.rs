use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{info, warn};

use crate::cli::{EmbedArgs, EmbedRefreshMode};
use crate::model::{EmbedRunManifest, FieldKind};
use crate::semantic::{
    SemanticModelConfig, embed_text_local, embedding_text_hash, encode_embedding_blob,
    resolve_model_config, value_payload_for_embedding,
};
use crate::util::{
    ensure_directory, manifest_dir, now_utc_string, resolve_db_path, utc_compact_string,
    write_json_pretty,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ValueKey {
    field_kind: FieldKind,
    value: String,
}

#[derive(Debug, Clone)]
struct ExistingEmbeddingRow {
    text_hash: String,
    embedding_dim: usize,
}

struct PendingEmbedding {
    key: ValueKey,
    text_hash: String,
    blob: Vec<u8>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct IndexBuildStats {
    pub(crate) eligible_values: usize,
    pub(crate) updated_values: usize,
    pub(crate) removed_values: usize,
    pub(crate) stale_values_before: usize,
    pub(crate) values_by_kind: BTreeMap<String, usize>,
}

pub fn run(args: EmbedArgs) -> Result<()> {
    let batch_size = args.batch_size.max(1);
    let model = resolve_model_config(&args.model_id);
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let manifest_dir = manifest_dir(&args.cache_root);
    ensure_directory(&manifest_dir)?;

    let started_at = now_utc_string();
    let started = Instant::now();
    let run_id = format!("embed-{}", utc_compact_string(Utc::now()));

    let mut connection = open_embed_connection(&db_path)?;
    let stats = build_value_index(&mut connection, &model, args.refresh_mode, batch_size)?;

    if stats.eligible_values == 0 {
        warn!(db = %db_path.display(), "no values found to index; run ingest first");
    }

    let manifest = EmbedRunManifest {
        manifest_version: 1,
        run_id,
        started_at,
        completed_at: now_utc_string(),
        db_path: db_path.display().to_string(),
        model_id: model.model_id.clone(),
        refresh_mode: args.refresh_mode.as_str().to_string(),
        eligible_values: stats.eligible_values,
        updated_values: stats.updated_values,
        stale_values_before: stats.stale_values_before,
        values_by_kind: stats.values_by_kind.clone(),
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
    };

    let manifest_path = manifest_dir.join(format!(
        "embed_run_{}.json",
        utc_compact_string(Utc::now())
    ));
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        model_id = %model.model_id,
        eligible_values = stats.eligible_values,
        updated_values = stats.updated_values,
        removed_values = stats.removed_values,
        "semantic index refresh completed"
    );

    Ok(())
}

fn open_embed_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| {
        format!(
            "failed to open database for embedding: {}",
            db_path.display()
        )
    })?;

    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL for embed")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL for embed")?;

    Ok(connection)
}

pub(crate) fn ensure_embedding_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS embedding_models (
          model_id TEXT PRIMARY KEY,
          backend TEXT NOT NULL,
          model_name TEXT NOT NULL,
          dimensions INTEGER NOT NULL,
          normalize INTEGER NOT NULL,
          created_at TEXT NOT NULL,
          config_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS value_embeddings (
          field_kind TEXT NOT NULL,
          value TEXT NOT NULL,
          model_id TEXT NOT NULL,
          embedding BLOB NOT NULL,
          embedding_dim INTEGER NOT NULL,
          text_hash TEXT NOT NULL,
          generated_at TEXT NOT NULL,
          PRIMARY KEY (field_kind, value, model_id),
          FOREIGN KEY (model_id) REFERENCES embedding_models(model_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_value_embeddings_model ON value_embeddings(model_id);
        ",
    )?;

    Ok(())
}

/// Embeds every distinct category, merchant and description value into `value_embeddings`.
/// `MissingOrStale` only rewrites entries whose text hash or dimension changed and drops
/// entries whose value no longer occurs in `transactions`.
pub(crate) fn build_value_index(
    connection: &mut Connection,
    model: &SemanticModelConfig,
    refresh_mode: EmbedRefreshMode,
    batch_size: usize,
) -> Result<IndexBuildStats> {
    ensure_embedding_schema(connection)?;
    ensure_model_entry(connection, model)?;

    let values = load_distinct_values(connection)?;
    let existing = load_existing_embeddings(connection, &model.model_id)?;

    let mut stats = IndexBuildStats::default();
    let mut pending = Vec::<PendingEmbedding>::new();
    let mut live_keys = HashSet::<ValueKey>::new();

    if refresh_mode == EmbedRefreshMode::Full {
        connection.execute(
            "DELETE FROM value_embeddings WHERE model_id = ?1",
            [&model.model_id],
        )?;
    }

    for key in values {
        let Some(payload) = value_payload_for_embedding(&key.value) else {
            continue;
        };

        stats.eligible_values += 1;
        *stats
            .values_by_kind
            .entry(key.field_kind.as_str().to_string())
            .or_insert(0) += 1;

        let text_hash = embedding_text_hash(&payload);
        let stale = existing
            .get(&key)
            .map(|row| row.text_hash != text_hash || row.embedding_dim != model.dimensions)
            .unwrap_or(true);
        if stale {
            stats.stale_values_before += 1;
        }
        live_keys.insert(key.clone());

        let should_update = match refresh_mode {
            EmbedRefreshMode::Full => true,
            EmbedRefreshMode::MissingOrStale => stale,
        };
        if !should_update {
            continue;
        }

        let embedding = embed_text_local(&payload, model.dimensions);
        pending.push(PendingEmbedding {
            key,
            text_hash,
            blob: encode_embedding_blob(&embedding),
        });

        if pending.len() >= batch_size {
            stats.updated_values += flush_embed_batch(connection, model, &mut pending)?;
            info!(
                model_id = %model.model_id,
                updated_values = stats.updated_values,
                "embed batch committed"
            );
        }
    }

    if !pending.is_empty() {
        stats.updated_values += flush_embed_batch(connection, model, &mut pending)?;
    }

    if refresh_mode == EmbedRefreshMode::MissingOrStale {
        let orphans = existing
            .keys()
            .filter(|key| !live_keys.contains(*key))
            .cloned()
            .collect::<Vec<ValueKey>>();
        stats.removed_values = remove_embeddings(connection, &model.model_id, &orphans)?;
    }

    Ok(stats)
}

fn ensure_model_entry(connection: &Connection, model: &SemanticModelConfig) -> Result<()> {
    let config_json = serde_json::json!({
        "model_id": model.model_id,
        "model_name": model.model_name,
        "dimensions": model.dimensions,
        "normalization": model.normalization,
        "backend": model.backend,
    })
    .to_string();

    connection.execute(
        "
        INSERT INTO embedding_models(model_id, backend, model_name, dimensions, normalize, created_at, config_json)
        VALUES(?1, ?2, ?3, ?4, 1, ?5, ?6)
        ON CONFLICT(model_id) DO UPDATE SET
          backend=excluded.backend,
          model_name=excluded.model_name,
          dimensions=excluded.dimensions,
          normalize=excluded.normalize,
          config_json=excluded.config_json
        ",
        params![
            model.model_id,
            model.backend,
            model.model_name,
            model.dimensions as i64,
            now_utc_string(),
            config_json,
        ],
    )?;

    Ok(())
}

fn load_distinct_values(connection: &Connection) -> Result<Vec<ValueKey>> {
    let mut out = Vec::<ValueKey>::new();

    for field_kind in FieldKind::ALL {
        let column = field_kind.column();
        let sql = format!(
            "
            SELECT DISTINCT \"{column}\"
            FROM transactions
            WHERE \"{column}\" IS NOT NULL AND TRIM(\"{column}\") <> ''
            ORDER BY \"{column}\" ASC
            "
        );
        let mut statement = connection
            .prepare(&sql)
            .with_context(|| format!("failed to read distinct {column} values"))?;
        let mut rows = statement.query([])?;
        while let Some(row) = rows.next()? {
            out.push(ValueKey {
                field_kind,
                value: row.get(0)?,
            });
        }
    }

    Ok(out)
}

fn load_existing_embeddings(
    connection: &Connection,
    model_id: &str,
) -> Result<HashMap<ValueKey, ExistingEmbeddingRow>> {
    let mut statement = connection.prepare(
        "
        SELECT field_kind, value, text_hash, embedding_dim
        FROM value_embeddings
        WHERE model_id = ?1
        ",
    )?;
    let mut rows = statement.query([model_id])?;
    let mut out = HashMap::<ValueKey, ExistingEmbeddingRow>::new();

    while let Some(row) = rows.next()? {
        let raw_kind: String = row.get(0)?;
        let Ok(field_kind) = raw_kind.parse::<FieldKind>() else {
            warn!(field_kind = %raw_kind, "ignoring embedding with unknown field kind");
            continue;
        };
        out.insert(
            ValueKey {
                field_kind,
                value: row.get(1)?,
            },
            ExistingEmbeddingRow {
                text_hash: row.get(2)?,
                embedding_dim: row.get::<_, i64>(3)? as usize,
            },
        );
    }

    Ok(out)
}

fn flush_embed_batch(
    connection: &mut Connection,
    model: &SemanticModelConfig,
    pending: &mut Vec<PendingEmbedding>,
) -> Result<usize> {
    if pending.is_empty() {
        return Ok(0);
    }

    let tx = connection.transaction()?;
    let mut updated = 0usize;
    {
        let mut statement = tx.prepare(
            "
            INSERT INTO value_embeddings(field_kind, value, model_id, embedding, embedding_dim, text_hash, generated_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(field_kind, value, model_id) DO UPDATE SET
              embedding=excluded.embedding,
              embedding_dim=excluded.embedding_dim,
              text_hash=excluded.text_hash,
              generated_at=excluded.generated_at
            ",
        )?;
        let generated_at = now_utc_string();

        for entry in pending.drain(..) {
            statement.execute(params![
                entry.key.field_kind.as_str(),
                entry.key.value,
                model.model_id,
                entry.blob,
                model.dimensions as i64,
                entry.text_hash,
                generated_at,
            ])?;
            updated += 1;
        }
    }
    tx.commit()?;

    Ok(updated)
}

fn remove_embeddings(connection: &mut Connection, model_id: &str, keys: &[ValueKey]) -> Result<usize> {
    if keys.is_empty() {
        return Ok(0);
    }

    let tx = connection.transaction()?;
    let mut removed = 0usize;
    {
        let mut statement = tx.prepare(
            "DELETE FROM value_embeddings WHERE field_kind = ?1 AND value = ?2 AND model_id = ?3",
        )?;
        for key in keys {
            removed += statement.execute(params![key.field_kind.as_str(), key.value, model_id])?;
        }
    }
    tx.commit()?;

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::create_seeded_db;

    fn seeded_connection(dir: &tempfile::TempDir) -> Connection {
        let db_path = dir.path().join("embed.sqlite");
        create_seeded_db(&db_path);
        Connection::open(&db_path).expect("open")
    }

    #[test]
    fn full_build_indexes_every_distinct_value_by_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut connection = seeded_connection(&dir);
        let model = resolve_model_config("");

        let stats = build_value_index(&mut connection, &model, EmbedRefreshMode::Full, 2)
            .expect("build");

        assert_eq!(stats.values_by_kind.get("category"), Some(&5));
        assert_eq!(stats.values_by_kind.get("merchant"), Some(&3));
        assert_eq!(stats.values_by_kind.get("description"), Some(&6));
        assert_eq!(stats.eligible_values, 14);
        assert_eq!(stats.updated_values, 14);
    }

    #[test]
    fn missing_or_stale_refresh_only_touches_changed_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut connection = seeded_connection(&dir);
        let model = resolve_model_config("");

        build_value_index(&mut connection, &model, EmbedRefreshMode::Full, 64).expect("build");
        let unchanged =
            build_value_index(&mut connection, &model, EmbedRefreshMode::MissingOrStale, 64)
                .expect("refresh");
        assert_eq!(unchanged.updated_values, 0);
        assert_eq!(unchanged.stale_values_before, 0);

        connection
            .execute(
                "UPDATE transactions SET merchant = 'BURGER BARN' WHERE merchant = 'STARBUCKS'",
                [],
            )
            .expect("update");
        let refreshed =
            build_value_index(&mut connection, &model, EmbedRefreshMode::MissingOrStale, 64)
                .expect("refresh");
        assert_eq!(refreshed.updated_values, 1);
        assert_eq!(refreshed.removed_values, 1);

        let stale_count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM value_embeddings WHERE value = 'STARBUCKS'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(stale_count, 0);
    }
}
