use std::io::{self, Write};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::SearchArgs;
use crate::model::CandidateSet;
use crate::retrieval::{SqliteValueIndex, retrieve};
use crate::semantic::resolve_model_config;
use crate::util::resolve_db_path;

pub fn run(args: SearchArgs) -> Result<()> {
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let index = SqliteValueIndex::open(&db_path, resolve_model_config(&args.model_id));

    info!(
        query = %args.query,
        model_id = %index.model().model_id,
        db = %db_path.display(),
        "search requested"
    );

    let candidates = retrieve(&index, &args.query)
        .with_context(|| format!("retrieval failed for '{}'", args.query))?;

    info!(returned = candidates.len(), "search complete");
    for candidate in candidates.iter() {
        debug!(
            field_kind = candidate.field_kind.as_str(),
            value = %candidate.value,
            distance = candidate.distance,
            "candidate"
        );
    }

    if args.json {
        write_json_response(&candidates)
    } else {
        write_text_response(&candidates)
    }
}

fn write_json_response(candidates: &CandidateSet) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, candidates)
        .context("failed to serialize search json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_response(candidates: &CandidateSet) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    writeln!(output, "Query: {}", candidates.query)?;
    if candidates.is_empty() {
        writeln!(output, "No matching values.")?;
    } else {
        writeln!(output, "{}", candidates.render_for_tool())?;
    }

    output.flush()?;
    Ok(())
}
