//! Column-kind inference for tabular catalog files.
//!
//! When a manifest entry omits `columns`, the resolver samples the first
//! data chunk of the file and infers a kind per column. Precedence:
//! numeric first (int before float), then boolean, then datetime, else
//! string.

use super::{ColumnInfo, ColumnKind};
use chrono::{NaiveDate, NaiveDateTime};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

/// Rows sampled per file for inference.
const SAMPLE_ROWS: usize = 200;

/// Infer column names and kinds from the header plus the first data chunk.
pub fn infer_columns(path: &Path, delimiter: char) -> io::Result<Vec<ColumnInfo>> {
    let file = File::open(path)?;
    let mut lines = BufReader::new(file).lines();

    let Some(header) = lines.next().transpose()? else {
        return Ok(Vec::new());
    };
    let names = split_record(&header, delimiter);

    let mut samples: Vec<Vec<String>> = vec![Vec::new(); names.len()];
    for line in lines.take(SAMPLE_ROWS) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        for (i, value) in split_record(&line, delimiter).into_iter().enumerate() {
            if i >= samples.len() {
                break;
            }
            let value = value.trim().to_string();
            if !value.is_empty() {
                samples[i].push(value);
            }
        }
    }

    Ok(names
        .into_iter()
        .zip(samples)
        .map(|(name, values)| ColumnInfo {
            name: name.trim().to_string(),
            kind: infer_kind(&values),
        })
        .collect())
}

/// Count data rows (total lines minus the header).
pub fn count_rows(path: &Path) -> io::Result<i64> {
    let file = File::open(path)?;
    let mut rows: i64 = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            rows += 1;
        }
    }
    Ok((rows - 1).max(0))
}

fn infer_kind(values: &[String]) -> ColumnKind {
    if values.is_empty() {
        return ColumnKind::String;
    }
    if values.iter().all(|v| v.parse::<i64>().is_ok()) {
        return ColumnKind::Int;
    }
    if values.iter().all(|v| v.parse::<f64>().is_ok()) {
        return ColumnKind::Float;
    }
    if values
        .iter()
        .all(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "false"))
    {
        return ColumnKind::Bool;
    }
    if values.iter().all(|v| parses_as_datetime(v)) {
        return ColumnKind::Datetime;
    }
    ColumnKind::String
}

fn parses_as_datetime(value: &str) -> bool {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
}

/// Split one CSV/TSV record, honoring double-quoted fields.
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}
