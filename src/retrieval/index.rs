use std::path::PathBuf;

use rusqlite::{Connection, OptionalExtension, params};

use crate::model::{Candidate, FieldKind};
use crate::semantic::{
    SemanticModelConfig, cosine_distance, decode_embedding_blob, embed_text_local,
};
use crate::store::{ReadOnlyPool, StoreError};

use super::{RetrievalError, SemanticIndex};

pub struct ValueIndexStatus {
    pub available: bool,
    pub reason: Option<String>,
    pub entry_count: i64,
}

pub fn value_index_status(
    connection: &Connection,
    model_id: &str,
) -> rusqlite::Result<ValueIndexStatus> {
    let embeddings_table_exists = connection
        .query_row(
            "
            SELECT name
            FROM sqlite_master
            WHERE type = 'table' AND name = 'value_embeddings'
            LIMIT 1
            ",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .is_some();

    if !embeddings_table_exists {
        return Ok(ValueIndexStatus {
            available: false,
            reason: Some("value_embeddings table is missing; run embed first".to_string()),
            entry_count: 0,
        });
    }

    let model_exists = connection
        .query_row(
            "SELECT 1 FROM embedding_models WHERE model_id = ?1 LIMIT 1",
            [model_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
        .is_some();
    if !model_exists {
        return Ok(ValueIndexStatus {
            available: false,
            reason: Some(format!("embedding model '{model_id}' is not registered")),
            entry_count: 0,
        });
    }

    let entry_count: i64 = connection.query_row(
        "SELECT COUNT(*) FROM value_embeddings WHERE model_id = ?1",
        [model_id],
        |row| row.get(0),
    )?;

    if entry_count <= 0 {
        return Ok(ValueIndexStatus {
            available: false,
            reason: Some(format!("semantic index is empty for model '{model_id}'")),
            entry_count,
        });
    }

    Ok(ValueIndexStatus {
        available: true,
        reason: None,
        entry_count,
    })
}

/// Orders hits by distance, breaking exact ties on the value and then the field kind so
/// equidistant entries always come back in the same order.
pub fn order_by_distance(hits: &mut [Candidate]) {
    hits.sort_by(|left, right| {
        left.distance
            .total_cmp(&right.distance)
            .then_with(|| left.value.cmp(&right.value))
            .then_with(|| left.field_kind.cmp(&right.field_kind))
    });
}

/// Semantic index persisted next to the transactions table by the `embed` command.
pub struct SqliteValueIndex {
    pool: ReadOnlyPool,
    model: SemanticModelConfig,
}

impl SqliteValueIndex {
    pub fn open(db_path: impl Into<PathBuf>, model: SemanticModelConfig) -> Self {
        Self {
            pool: ReadOnlyPool::new(db_path),
            model,
        }
    }

    pub fn model(&self) -> &SemanticModelConfig {
        &self.model
    }

    fn scan(&self, connection: &Connection, text: &str, k: usize) -> rusqlite::Result<Scan> {
        let status = value_index_status(connection, &self.model.model_id)?;
        if !status.available {
            return Ok(Scan::Unavailable(
                status.reason.unwrap_or_else(|| "semantic index unavailable".to_string()),
            ));
        }

        let query_embedding = embed_text_local(text, self.model.dimensions);
        let mut statement = connection.prepare(
            "
            SELECT field_kind, value, embedding, embedding_dim
            FROM value_embeddings
            WHERE model_id = ?1
            ",
        )?;
        let mut rows = statement.query(params![self.model.model_id])?;

        let mut hits = Vec::<Candidate>::new();
        while let Some(row) = rows.next()? {
            let row_dim = row.get::<_, i64>(3)? as usize;
            if row_dim != self.model.dimensions {
                continue;
            }

            let Ok(field_kind) = row.get::<_, String>(0)?.parse::<FieldKind>() else {
                continue;
            };
            let blob = row.get::<_, Vec<u8>>(2)?;
            let Some(embedding) = decode_embedding_blob(&blob, self.model.dimensions) else {
                continue;
            };

            hits.push(Candidate {
                value: row.get(1)?,
                field_kind,
                distance: cosine_distance(&query_embedding, &embedding),
            });
        }

        order_by_distance(&mut hits);
        hits.truncate(k);
        Ok(Scan::Hits(hits))
    }
}

enum Scan {
    Hits(Vec<Candidate>),
    Unavailable(String),
}

impl SemanticIndex for SqliteValueIndex {
    fn nearest(&self, text: &str, k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        let scan = self
            .pool
            .with_connection(|connection| self.scan(connection, text, k))
            .map_err(|err| RetrievalError::IndexUnavailable {
                reason: match err {
                    StoreError::Unavailable { reason } => reason,
                    StoreError::Statement { message } => message,
                },
            })?;

        match scan {
            Scan::Hits(hits) => Ok(hits),
            Scan::Unavailable(reason) => Err(RetrievalError::IndexUnavailable { reason }),
        }
    }
}
