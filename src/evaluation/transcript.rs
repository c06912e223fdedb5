use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::tools::TransactionTools;

use super::CaseError;
use super::fixture::EvaluationCase;

const SQL_TOOL: &str = "sql_db_query";
const RETRIEVAL_TOOL: &str = "vector_search";

/// Produces the final answer for a case, calling the tools zero or more times on the way.
pub trait DecisionLoop: Send + Sync {
    fn run(&self, case: &EvaluationCase, tools: &dyn TransactionTools) -> Result<String, CaseError>;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ToolInvocation {
    Retrieve(String),
    Query(String),
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RecordedTranscript {
    #[serde(alias = "test_id")]
    pub(crate) case_id: String,
    #[serde(default)]
    pub(crate) messages: Vec<Value>,
    #[serde(default)]
    pub(crate) final_answer: Option<String>,
}

impl RecordedTranscript {
    /// Tool calls in the order the agent issued them. Without an explicit `final_answer` the
    /// last message is the answer, so its text is never read as a call.
    pub(crate) fn invocations(&self) -> Vec<ToolInvocation> {
        let mut out = Vec::<ToolInvocation>::new();
        let answer_position = match self.final_answer {
            Some(_) => None,
            None => self.messages.len().checked_sub(1),
        };

        for (position, message) in self.messages.iter().enumerate() {
            if is_tool_output(message) {
                continue;
            }

            if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                out.extend(calls.iter().filter_map(structured_call));
            }

            if Some(position) == answer_position {
                continue;
            }
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                if let Some(invocation) = content_call(content) {
                    out.push(invocation);
                }
            }
        }

        out
    }

    /// The explicit `final_answer`, else the content of the last message.
    pub(crate) fn answer(&self) -> Option<String> {
        if let Some(answer) = &self.final_answer {
            return Some(answer.clone());
        }

        self.messages.last().and_then(|message| match message.get("content") {
            Some(Value::String(text)) => Some(text.clone()),
            Some(Value::Array(parts)) => Some(
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<&str>>()
                    .join(""),
            ),
            _ => None,
        })
    }
}

fn is_tool_output(message: &Value) -> bool {
    ["type", "role"].iter().any(|key| {
        message
            .get(*key)
            .and_then(Value::as_str)
            .is_some_and(|kind| kind == "tool")
    })
}

// LangChain-style `{"name", "args"}` or OpenAI-style `{"function": {"name", "arguments"}}`.
fn structured_call(call: &Value) -> Option<ToolInvocation> {
    let function = call.get("function");
    let name = call
        .get("name")
        .or_else(|| function.and_then(|function| function.get("name")))
        .and_then(Value::as_str)?;

    let args = match call.get("args") {
        Some(args) => args.clone(),
        None => match function.and_then(|function| function.get("arguments")) {
            Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).ok()?,
            Some(args) => args.clone(),
            None => return None,
        },
    };
    let query = args.get("query").and_then(Value::as_str)?.trim().to_string();

    invocation_for(name, query)
}

fn content_call(content: &str) -> Option<ToolInvocation> {
    let trimmed = content.trim();

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        if let Ok(Value::Object(data)) = serde_json::from_str::<Value>(trimmed) {
            let name = data
                .get("tool")
                .or_else(|| data.get("name"))
                .and_then(Value::as_str)?;
            let query = data.get("query").and_then(Value::as_str)?.trim().to_string();
            return invocation_for(name, query);
        }
    }

    is_bare_select(trimmed).then(|| ToolInvocation::Query(trimmed.to_string()))
}

// Leading word `select` plus a later `from` word; "Selected period ..." is prose.
fn is_bare_select(text: &str) -> bool {
    if !text.starts_with(|first: char| first.is_ascii_alphabetic()) {
        return false;
    }
    let mut words = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty());
    words
        .next()
        .is_some_and(|word| word.eq_ignore_ascii_case("select"))
        && words.any(|word| word.eq_ignore_ascii_case("from"))
}

fn invocation_for(name: &str, query: String) -> Option<ToolInvocation> {
    if query.is_empty() {
        return None;
    }
    match name {
        SQL_TOOL => Some(ToolInvocation::Query(query)),
        RETRIEVAL_TOOL => Some(ToolInvocation::Retrieve(query)),
        _ => None,
    }
}

/// Replays recorded agent transcripts through the live tools, so every recorded query is
/// authorized and executed again under the case's scope.
pub struct TranscriptReplay {
    transcripts: HashMap<String, RecordedTranscript>,
}

impl TranscriptReplay {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let document: Value = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Self::from_value(document)
    }

    pub(crate) fn from_value(document: Value) -> Result<Self> {
        let records = match document {
            Value::Array(records) => records,
            Value::Object(mut object) => match object.remove("transcripts") {
                Some(Value::Array(records)) => records,
                _ => bail!("transcript object must contain a 'transcripts' array"),
            },
            _ => bail!("transcripts must be a JSON array"),
        };

        let mut transcripts = HashMap::<String, RecordedTranscript>::new();
        for (position, record) in records.into_iter().enumerate() {
            match serde_json::from_value::<RecordedTranscript>(record) {
                Ok(transcript) => {
                    if transcripts.contains_key(&transcript.case_id) {
                        warn!(case_id = %transcript.case_id, "duplicate transcript; keeping the first");
                        continue;
                    }
                    transcripts.insert(transcript.case_id.clone(), transcript);
                }
                Err(err) => {
                    warn!(position, error = %err, "skipping malformed transcript");
                }
            }
        }

        Ok(Self { transcripts })
    }

    pub fn len(&self) -> usize {
        self.transcripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transcripts.is_empty()
    }
}

impl DecisionLoop for TranscriptReplay {
    fn run(&self, case: &EvaluationCase, tools: &dyn TransactionTools) -> Result<String, CaseError> {
        let Some(transcript) = self.transcripts.get(&case.id) else {
            return Err(CaseError::Decision(format!(
                "no transcript recorded for case '{}'",
                case.id
            )));
        };

        for invocation in transcript.invocations() {
            match invocation {
                ToolInvocation::Retrieve(query) => {
                    let outcome = tools.retrieve(&query);
                    debug!(case_id = %case.id, query = %query, ok = outcome.is_ok(), "replayed retrieval");
                }
                ToolInvocation::Query(text) => {
                    let verdict = tools.authorize_and_run(case.scope, &text);
                    debug!(case_id = %case.id, authorized = verdict.is_authorized(), "replayed query");
                }
            }
        }

        transcript.answer().ok_or_else(|| {
            CaseError::Decision(format!("transcript for case '{}' has no final answer", case.id))
        })
    }
}
