//! Pull-request turnaround benchmark.
//!
//! For every project, every pull request whose head repository is that
//! project contributes the span from its first history event to its last
//! `closed*`/`merged*` event. Spans are averaged per project; the ten largest
//! averages are returned in ascending order. All arithmetic is in integer
//! milliseconds.

use crate::engine::Connection;
use chrono::DateTime;
use mlepack_core::{BindValue, MleError, Record, RowMapper};
use serde_json::Value;

const TOP: usize = 10;

/// Run the benchmark over the session connection.
pub async fn run(conn: &dyn Connection) -> Result<Vec<i64>, MleError> {
    let projects = query(conn, "SELECT * FROM PROJECTS", &[]).await?;

    let mut averages = Vec::new();
    for project in &projects {
        let Some(id) = project.get("id") else {
            continue;
        };
        let prs = query(
            conn,
            "SELECT * FROM pull_requests WHERE head_repo_id = :in0",
            &[BindValue::from_json(id)?],
        )
        .await?;

        let mut spans = Vec::new();
        for pr in &prs {
            let Some(pr_id) = pr.get("id") else {
                continue;
            };
            let events = query(
                conn,
                "SELECT * FROM pull_request_history WHERE pull_request_id = :in0",
                &[BindValue::from_json(pr_id)?],
            )
            .await?;
            if let Some(span) = span(&events) {
                spans.push(span);
            }
        }

        if let Some(avg) = average(&spans) {
            averages.push(avg);
        }
    }

    Ok(top(averages))
}

async fn query(
    conn: &dyn Connection,
    sql: &str,
    binds: &[BindValue],
) -> Result<Vec<Record>, MleError> {
    let execution = conn.execute(sql, binds).await?;
    Ok(RowMapper::new(execution.rows()).eject().to_vec())
}

/// First event to last closing event, or `None` when either is missing.
pub fn span(events: &[Record]) -> Option<i64> {
    let mut opened: Option<i64> = None;
    let mut last: Option<i64> = None;
    for event in events {
        let Some(at) = event.get("created_at").and_then(millis) else {
            continue;
        };
        opened = Some(opened.map_or(at, |o| o.min(at)));

        let closing = event
            .get("action")
            .and_then(Value::as_str)
            .is_some_and(|a| a.starts_with("closed") || a.starts_with("merged"));
        if closing {
            last = Some(last.map_or(at, |l| l.max(at)));
        }
    }
    last?.checked_sub(opened?)
}

fn average(spans: &[i64]) -> Option<i64> {
    if spans.is_empty() {
        return None;
    }
    let total: i128 = spans.iter().map(|&s| i128::from(s)).sum();
    i64::try_from(total / spans.len() as i128).ok()
}

fn top(mut averages: Vec<i64>) -> Vec<i64> {
    averages.sort_unstable();
    let start = averages.len().saturating_sub(TOP);
    averages.split_off(start)
}

/// Epoch milliseconds from a number or an RFC 3339 string.
fn millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .ok()
            .or_else(|| s.trim().parse().ok()),
        _ => None,
    }
}
