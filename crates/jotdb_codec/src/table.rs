//! Pipe-delimited table row codec.

use crate::error::{CodecError, CodecResult};
use crate::schema::{ColumnType, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Leading marker byte of a stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowMarker {
    /// Live row, no escaped cells.
    Live,
    /// Live row, at least one cell was percent-escaped.
    Escaped,
    /// Logically deleted row.
    Tombstone,
}

impl RowMarker {
    /// Parses a marker byte.
    #[must_use]
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'+' => Some(Self::Live),
            b'*' => Some(Self::Escaped),
            b'-' => Some(Self::Tombstone),
            _ => None,
        }
    }

    /// Returns the marker character.
    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::Live => '+',
            Self::Escaped => '*',
            Self::Tombstone => '-',
        }
    }
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "%7C").replace('\r', "%0D").replace('\n', "%0A")
}

fn unescape_cell(cell: &str) -> String {
    cell.replace("%7C", "|").replace("%0D", "\r").replace("%0A", "\n")
}

fn needs_escape(cell: &str) -> bool {
    cell.contains('|') || cell.contains('\r') || cell.contains('\n')
}

fn parse_date_ms(column: &str, value: &Value) -> CodecResult<Option<i64>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| CodecError::not_representable(column, "date")),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.timestamp_millis()))
            .map_err(|_| CodecError::not_representable(column, "date")),
        _ => Err(CodecError::not_representable(column, "date")),
    }
}

/// Encodes one row under the given schema, without the trailing newline.
///
/// Cells holding `|`, `\r`, or `\n` force the `*` marker and are
/// percent-escaped; this only ever applies to string and object columns,
/// the other types cannot produce those bytes.
pub fn encode_row(schema: &Schema, doc: &Value) -> CodecResult<String> {
    let Some(fields) = doc.as_object() else {
        return Err(CodecError::NotAnObject);
    };

    let mut cells = Vec::with_capacity(schema.len());
    let mut escaped = false;

    for column in schema.columns() {
        let value = fields.get(&column.name).unwrap_or(&Value::Null);
        let cell = match column.kind {
            ColumnType::String => match value {
                Value::Null => String::new(),
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            },
            ColumnType::Number => match value {
                Value::Null => String::new(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
                Value::String(s) if s.parse::<f64>().is_ok() => s.clone(),
                _ => return Err(CodecError::not_representable(&column.name, "number")),
            },
            ColumnType::Boolean => match value {
                Value::Null => String::new(),
                Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
                Value::Number(n) => {
                    (if n.as_f64().unwrap_or(0.0) != 0.0 { "1" } else { "0" }).to_string()
                }
                _ => return Err(CodecError::not_representable(&column.name, "boolean")),
            },
            ColumnType::Date => match parse_date_ms(&column.name, value)? {
                Some(ms) => ms.to_string(),
                None => String::new(),
            },
            ColumnType::Object => match value {
                Value::Null => String::new(),
                other => other.to_string(),
            },
        };

        if matches!(column.kind, ColumnType::String | ColumnType::Object) && needs_escape(&cell) {
            escaped = true;
        }
        cells.push(cell);
    }

    let marker = if escaped {
        RowMarker::Escaped
    } else {
        RowMarker::Live
    };

    let mut out = String::with_capacity(32);
    out.push(marker.as_char());
    for (column, cell) in schema.columns().iter().zip(&cells) {
        out.push('|');
        if escaped && matches!(column.kind, ColumnType::String | ColumnType::Object) {
            out.push_str(&escape_cell(cell));
        } else {
            out.push_str(cell);
        }
    }

    Ok(out)
}

/// Decodes one stored row line.
///
/// Returns `None` for tombstoned rows and for lines without a valid marker.
/// `keys` restricts decoding to a subset of columns; fields outside the
/// subset are skipped entirely. Malformed cells decode to the column type's
/// zero value; empty cells are absent from the result.
#[must_use]
pub fn decode_row(schema: &Schema, line: &str, keys: Option<&[String]>) -> Option<Value> {
    let marker = RowMarker::from_byte(*line.as_bytes().first()?)?;
    if marker == RowMarker::Tombstone {
        return None;
    }

    let parts: Vec<&str> = line.split('|').collect();
    let mut fields = Map::new();

    for column in schema.columns() {
        if let Some(keys) = keys {
            if !keys.iter().any(|k| k == &column.name) {
                continue;
            }
        }

        let raw = match parts.get(column.position) {
            Some(cell) if !cell.is_empty() => *cell,
            _ => continue,
        };

        let needs_unescape = marker == RowMarker::Escaped
            && matches!(column.kind, ColumnType::String | ColumnType::Object);
        let cell = if needs_unescape {
            unescape_cell(raw)
        } else {
            (*raw).to_string()
        };

        let value = match column.kind {
            ColumnType::String => Value::String(cell),
            ColumnType::Number => cell
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| cell.parse::<f64>().map(Value::from))
                .unwrap_or_else(|_| Value::from(0)),
            ColumnType::Boolean => Value::Bool(cell == "1"),
            ColumnType::Date => match cell.parse::<i64>() {
                Ok(ms) => match DateTime::<Utc>::from_timestamp_millis(ms) {
                    Some(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                    None => Value::Null,
                },
                Err(_) => Value::Null,
            },
            ColumnType::Object => serde_json::from_str(&cell).unwrap_or(Value::Null),
        };

        fields.insert(column.name.clone(), value);
    }

    Some(Value::Object(fields))
}
