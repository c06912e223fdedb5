use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::SqlArgs;
use crate::gateway::{QueryGateway, QueryRequest, QueryVerdict};
use crate::model::{ClientScope, QueryRows};
use crate::store::SqliteStore;
use crate::util::resolve_db_path;

pub fn run(args: SqlArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let scope = ClientScope::new(args.client_id);
    let gateway = QueryGateway::new(Arc::new(SqliteStore::open(&db_path)))?;

    info!(scope = scope.id(), db = %db_path.display(), "sql requested");

    let verdict = gateway.authorize_and_run(&QueryRequest::new(scope, args.query.as_str()));

    info!(
        authorized = verdict.is_authorized(),
        rows = verdict.rows().map(QueryRows::len).unwrap_or(0),
        reason = verdict.rejection_reason().map(|reason| reason.as_str()).unwrap_or(""),
        "sql complete"
    );

    // Rejections are results, not failures; the exit status stays 0.
    if args.json {
        write_json_response(&verdict)
    } else {
        write_text_response(&verdict, scope)
    }
}

fn write_json_response(verdict: &QueryVerdict) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, verdict)
        .context("failed to serialize sql json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_response(verdict: &QueryVerdict, scope: ClientScope) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, "{}", verdict.render_for_tool(scope))?;
    if verdict.rows().is_some_and(QueryRows::is_empty) {
        writeln!(output, "No rows matched.")?;
    }
    output.flush()?;
    Ok(())
}
