//! Trace export: a standalone HTML viewer, or plain JSON.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use minijinja::{Environment, Value, context};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::core::state::{Scope, Trace, TraceEvent};

const TRACE_TEMPLATE: &str = include_str!("templates/trace.html");

/// One trace event with its position and offset from the first event.
#[derive(Debug, Serialize)]
pub struct ExportedEvent<'a> {
    pub id: usize,
    pub op: &'a str,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the first event, millisecond precision.
    pub delta: f64,
    #[serde(skip_serializing_if = "<[Scope]>::is_empty")]
    pub scope: &'a [Scope],
    pub payload: &'a Json,
}

#[derive(Debug, Serialize)]
struct Row<'a> {
    id: usize,
    delta: f64,
    op: &'a str,
    scope: String,
    outcome: Option<&'a str>,
    payload_text: String,
}

fn delta(first: &TraceEvent, event: &TraceEvent) -> f64 {
    (event.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0
}

pub fn export_events(trace: &Trace) -> Vec<ExportedEvent<'_>> {
    let Some(first) = trace.events().first() else {
        return Vec::new();
    };
    trace
        .iter()
        .enumerate()
        .map(|(id, event)| ExportedEvent {
            id,
            op: &event.op,
            timestamp: event.timestamp,
            delta: delta(first, event),
            scope: &event.scope,
            payload: &event.payload,
        })
        .collect()
}

/// Standalone HTML page listing every event, filterable by operation.
/// The raw events are embedded as JSON under `#trace-data`.
pub fn render_trace_html(title: &str, trace: &Trace) -> Result<String> {
    let events = export_events(trace);
    let rows: Vec<Row<'_>> = events
        .iter()
        .map(|event| Row {
            id: event.id,
            delta: event.delta,
            op: event.op,
            scope: event
                .scope
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "),
            outcome: event.payload.get("outcome").and_then(Json::as_str),
            payload_text: event.payload.to_string(),
        })
        .collect();
    let mut ops: BTreeMap<&str, usize> = BTreeMap::new();
    for event in &events {
        *ops.entry(event.op).or_default() += 1;
    }
    // `<` is escaped so no payload can close the script element.
    let embedded = serde_json::to_string(&events)
        .context("serialize trace events")?
        .replace('<', "\\u003c");

    let mut env = Environment::new();
    env.add_template("trace.html", TRACE_TEMPLATE)
        .context("load trace template")?;
    let rendered = env
        .get_template("trace.html")
        .context("load trace template")?
        .render(context! {
            title => title,
            events => rows,
            ops => ops.into_iter().collect::<Vec<_>>(),
            span => events.last().map_or(0.0, |event| event.delta),
            trace_json => Value::from_safe_string(embedded),
        })
        .context("render trace template")?;
    Ok(rendered)
}

/// Write the trace to `path`: HTML for `.html`/`.htm`, pretty JSON otherwise.
pub fn write_trace(path: &Path, title: &str, trace: &Trace) -> Result<()> {
    let html = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"));
    let contents = if html {
        render_trace_html(title, trace)?
    } else {
        let mut buf =
            serde_json::to_string_pretty(&export_events(trace)).context("serialize trace")?;
        buf.push('\n');
        buf
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write trace {}", path.display()))?;
    debug!(path = %path.display(), events = trace.len(), html, "trace written");
    Ok(())
}
