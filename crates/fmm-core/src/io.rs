//! The ScalFMM task-timer record format.
//!
//! One line-per-record ASCII log: a `global{...}` header followed by zero
//! or more `event{...}` lines, each a `;`-separated `@key=value` run
//! wrapped in braces. The only persisted format here that isn't JSON —
//! everything else goes through `serde` — so this gets a small
//! hand-written writer/parser instead of a derive.

use std::fmt::Write as _;

use crate::error::{FmmError, FmmResult};

/// One `event{...}` line: an operator invocation's timing.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub id: u64,
    pub duration: f64,
    pub start: f64,
    /// Free-text label, truncated to 16 characters on write per the format.
    pub text: String,
}

/// The full record dumped by one engine run: a `global{...}` summary plus
/// its `event{...}` lines, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTimerRecord {
    pub duration: f64,
    pub max_threads: u32,
    pub events: Vec<TaskEvent>,
}

impl TaskTimerRecord {
    /// Render to the ASCII format, newline-terminated.
    pub fn write_to_string(&self) -> String {
        let mut out = String::new();
        out.push_str("ScalFMM Task Records\n");
        let _ = writeln!(
            out,
            "global{{@duration={};@max threads={};@nb events={}}}",
            format_seconds(self.duration),
            self.max_threads,
            self.events.len()
        );
        for event in &self.events {
            let text: String = event.text.chars().take(16).collect();
            let _ = writeln!(
                out,
                "event{{@id={};@duration={};@start={};@text={}}}",
                event.id,
                format_seconds(event.duration),
                format_seconds(event.start),
                text
            );
        }
        out
    }

    /// Parse the ASCII format back. Surfaces the offending
    /// line index on malformed input, per the I/O error contract.
    pub fn parse(input: &str) -> FmmResult<Self> {
        let mut lines = input.lines().enumerate();

        match lines.next() {
            Some((_, "ScalFMM Task Records")) => {}
            Some((index, other)) => {
                return Err(FmmError::io(index, format!("expected header line, found {other:?}")))
            }
            None => return Err(FmmError::io(0, "empty record")),
        }

        let (global_index, global_line) = lines
            .next()
            .ok_or_else(|| FmmError::io(1, "missing global{} line"))?;
        let fields = parse_braced_fields(global_line, "global", global_index)?;
        let duration = field_f64(&fields, "duration", global_index)?;
        let max_threads = field_u64(&fields, "max threads", global_index)? as u32;
        let nb_events = field_u64(&fields, "nb events", global_index)? as usize;

        let mut events = Vec::with_capacity(nb_events);
        for (index, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields = parse_braced_fields(line, "event", index)?;
            events.push(TaskEvent {
                id: field_u64(&fields, "id", index)?,
                duration: field_f64(&fields, "duration", index)?,
                start: field_f64(&fields, "start", index)?,
                text: field_str(&fields, "text", index)?.chars().take(16).collect(),
            });
        }

        if events.len() != nb_events {
            return Err(FmmError::io(
                global_index,
                format!("global declared {nb_events} events but found {}", events.len()),
            ));
        }

        Ok(TaskTimerRecord { duration, max_threads, events })
    }
}

fn format_seconds(value: f64) -> String {
    format!("{value:.6}")
}

fn parse_braced_fields<'a>(line: &'a str, expected_tag: &str, index: usize) -> FmmResult<Vec<(&'a str, &'a str)>> {
    let rest = line
        .strip_prefix(expected_tag)
        .ok_or_else(|| FmmError::io(index, format!("expected {expected_tag}{{...}} line, found {line:?}")))?;
    let body = rest
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| FmmError::io(index, format!("malformed braces in line {line:?}")))?;

    body.split(';')
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let pair = pair.strip_prefix('@').unwrap_or(pair);
            pair.split_once('=')
                .ok_or_else(|| FmmError::io(index, format!("malformed field {pair:?}")))
        })
        .collect()
}

fn field_str<'a>(fields: &[(&'a str, &'a str)], key: &str, index: usize) -> FmmResult<&'a str> {
    fields
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .ok_or_else(|| FmmError::io(index, format!("missing field {key:?}")))
}

fn field_f64(fields: &[(&str, &str)], key: &str, index: usize) -> FmmResult<f64> {
    field_str(fields, key, index)?
        .parse()
        .map_err(|_| FmmError::io(index, format!("field {key:?} is not a number")))
}

fn field_u64(fields: &[(&str, &str)], key: &str, index: usize) -> FmmResult<u64> {
    field_str(fields, key, index)?
        .parse()
        .map_err(|_| FmmError::io(index, format!("field {key:?} is not an integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskTimerRecord {
        TaskTimerRecord {
            duration: 1.25,
            max_threads: 8,
            events: vec![
                TaskEvent { id: 0, duration: 0.01, start: 0.0, text: "p2m".to_string() },
                TaskEvent { id: 1, duration: 0.02, start: 0.01, text: "m2l-level-2".to_string() },
            ],
        }
    }

    #[test]
    fn write_then_parse_round_trips() {
        let record = sample();
        let text = record.write_to_string();
        let parsed = TaskTimerRecord::parse(&text).unwrap();
        assert_eq!(parsed.duration, record.duration);
        assert_eq!(parsed.max_threads, record.max_threads);
        assert_eq!(parsed.events.len(), record.events.len());
        assert_eq!(parsed.events[0].id, 0);
        assert_eq!(parsed.events[1].text, "m2l-level-2".chars().take(16).collect::<String>());
    }

    #[test]
    fn long_text_field_is_truncated_to_16_chars() {
        let mut record = sample();
        record.events[0].text = "this-label-is-way-too-long".to_string();
        let text = record.write_to_string();
        let parsed = TaskTimerRecord::parse(&text).unwrap();
        assert_eq!(parsed.events[0].text.chars().count(), 16);
    }

    #[test]
    fn missing_header_is_rejected_with_line_index() {
        let err = TaskTimerRecord::parse("not a header\n").unwrap_err();
        match err {
            FmmError::Io { index, .. } => assert_eq!(index, 0),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn event_count_mismatch_is_rejected() {
        let text = "ScalFMM Task Records\nglobal{@duration=1.000000;@max threads=1;@nb events=2}\n";
        let err = TaskTimerRecord::parse(text).unwrap_err();
        assert!(matches!(err, FmmError::Io { .. }));
    }
}
