use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::EvaluateArgs;
use crate::evaluation::{
    EngineConfig, EvaluationEngine, FixtureEntry, RunMetadata, RunReport, TranscriptReplay,
    load_fixture, render_text_report,
};
use crate::gateway::QueryGateway;
use crate::retrieval::SqliteValueIndex;
use crate::semantic::resolve_model_config;
use crate::store::{RelationalStore, SqliteStore};
use crate::tools::ToolBox;
use crate::util::{
    ensure_directory, manifest_dir, now_utc_string, resolve_db_path, utc_compact_string,
    write_json_pretty, write_text,
};

pub fn run(args: EvaluateArgs) -> Result<()> {
    let stamp = utc_compact_string(Utc::now());
    let started_at = now_utc_string();
    let run_id = format!("eval-{stamp}");

    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let manifest_dir = manifest_dir(&args.cache_root);
    ensure_directory(&manifest_dir)?;
    let report_path = args
        .report_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join(format!("evaluation_results_{stamp}.json")));
    let text_report_path = args
        .text_report_path
        .clone()
        .unwrap_or_else(|| manifest_dir.join(format!("evaluation_report_{stamp}.txt")));

    let entries = load_fixture(&args.fixture_path)?;
    let invalid = entries
        .iter()
        .filter(|entry| matches!(entry, FixtureEntry::Invalid { .. }))
        .map(FixtureEntry::id)
        .collect::<Vec<&str>>();
    if !invalid.is_empty() {
        warn!(cases = %invalid.join(", "), "fixture entries failed to parse; they will score zero");
    }

    let replay = TranscriptReplay::load(&args.transcripts_path)?;
    if replay.is_empty() {
        warn!(path = %args.transcripts_path.display(), "no transcripts loaded; every case will error");
    }

    info!(
        run_id = %run_id,
        cases = entries.len(),
        transcripts = replay.len(),
        db = %db_path.display(),
        model_label = %args.model_label,
        "starting evaluation"
    );

    let store: Arc<dyn RelationalStore> = Arc::new(SqliteStore::open(&db_path));
    let index = Arc::new(SqliteValueIndex::open(
        &db_path,
        resolve_model_config(&args.model_id),
    ));
    let gateway = QueryGateway::new(Arc::clone(&store))?;
    let tools = Arc::new(ToolBox::new(index, gateway));

    let config = EngineConfig {
        workers: args.workers.max(1),
        case_timeout_ms: args.case_timeout_ms,
    };
    let engine = EvaluationEngine::new(tools, store, Arc::new(replay), config)?;
    let cases = engine.run(&entries)?;

    let metadata = RunMetadata {
        run_id,
        model_label: args.model_label.clone(),
        started_at,
        completed_at: now_utc_string(),
        workers: config.workers,
        case_timeout_ms: config.case_timeout_ms,
        fixture_path: args.fixture_path.display().to_string(),
        transcripts_path: args.transcripts_path.display().to_string(),
    };
    let report = RunReport::new(metadata, cases);
    let text_report = render_text_report(&report);

    write_json_pretty(&report_path, &report)?;
    write_text(&text_report_path, &text_report)?;

    info!(
        passed = report.summary.passed_cases,
        total = report.summary.total_cases,
        errored = report.summary.errored_cases,
        mean_overall = report.summary.mean_overall,
        report = %report_path.display(),
        text_report = %text_report_path.display(),
        "evaluation complete"
    );

    let mut output = io::BufWriter::new(io::stdout().lock());
    writeln!(output, "{text_report}").context("failed to write evaluation report")?;
    output.flush()?;

    Ok(())
}
