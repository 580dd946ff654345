//! Table schema: ordered, typed columns persisted as the file header.

use crate::error::{CodecError, CodecResult};
use std::fmt;

/// Type of a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// UTF-8 text, percent-escaped when needed.
    String,
    /// Decimal number.
    Number,
    /// Boolean, stored as `1` or `0`.
    Boolean,
    /// Timestamp, stored as milliseconds since the Unix epoch.
    Date,
    /// Arbitrary JSON value, stored serialized and percent-escaped.
    Object,
}

impl ColumnType {
    /// Numeric code used in compact contexts.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::String => 1,
            Self::Number => 2,
            Self::Boolean => 3,
            Self::Date => 4,
            Self::Object => 5,
        }
    }

    /// Type name used in the schema header.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Object => "object",
        }
    }

    /// Parses a type name from a schema definition.
    pub fn parse(name: &str) -> CodecResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "1" => Ok(Self::String),
            "number" | "2" => Ok(Self::Number),
            "boolean" | "bool" | "3" => Ok(Self::Boolean),
            "date" | "4" => Ok(Self::Date),
            "object" | "5" => Ok(Self::Object),
            other => Err(CodecError::unknown_column_type(other)),
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type.
    pub kind: ColumnType,
    /// 1-based position in the pipe-delimited row (0 is the marker).
    pub position: usize,
}

/// An ordered list of typed columns.
///
/// The schema is persisted as the table file's first line, for example
/// `id:string|age:number|joined:date`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Parses a schema definition or header line.
    ///
    /// Accepts `name:type` pairs separated by `|`. Missing types default to
    /// `string`.
    pub fn parse(definition: &str) -> CodecResult<Self> {
        let definition = definition.trim();
        if definition.is_empty() {
            return Err(CodecError::invalid_schema("empty definition"));
        }

        let mut columns = Vec::new();
        for (index, part) in definition.split('|').enumerate() {
            let part = part.trim();
            if part.is_empty() {
                return Err(CodecError::invalid_schema(format!(
                    "empty column at position {}",
                    index + 1
                )));
            }
            let (name, kind) = match part.split_once(':') {
                Some((name, kind)) => (name.trim(), ColumnType::parse(kind)?),
                None => (part, ColumnType::String),
            };
            if name.is_empty() {
                return Err(CodecError::invalid_schema(format!(
                    "missing column name at position {}",
                    index + 1
                )));
            }
            columns.push(Column {
                name: name.to_string(),
                kind,
                position: index + 1,
            });
        }

        Ok(Self { columns })
    }

    /// Renders the header line, without the trailing newline.
    #[must_use]
    pub fn header(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.kind))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Returns the declared columns in order.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_render_header() {
        let schema = Schema::parse("id:string|age:number|ok:boolean|dt:date|meta:object").unwrap();
        assert_eq!(schema.len(), 5);
        assert_eq!(
            schema.header(),
            "id:string|age:number|ok:boolean|dt:date|meta:object"
        );
        assert_eq!(schema.get("dt").unwrap().kind, ColumnType::Date);
        assert_eq!(schema.get("dt").unwrap().position, 3 + 1);
    }

    #[test]
    fn untyped_column_defaults_to_string() {
        let schema = Schema::parse("id|name").unwrap();
        assert_eq!(schema.get("id").unwrap().kind, ColumnType::String);
        assert_eq!(schema.header(), "id:string|name:string");
    }

    #[test]
    fn numeric_type_codes_accepted() {
        let schema = Schema::parse("a:1|b:2|c:3|d:4|e:5").unwrap();
        let kinds: Vec<ColumnType> = schema.columns().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ColumnType::String,
                ColumnType::Number,
                ColumnType::Boolean,
                ColumnType::Date,
                ColumnType::Object
            ]
        );
    }

    #[test]
    fn invalid_definitions_rejected() {
        assert!(Schema::parse("").is_err());
        assert!(Schema::parse("a:string||b:number").is_err());
        assert!(Schema::parse("a:wat").is_err());
        assert!(Schema::parse(":string").is_err());
    }

    #[test]
    fn header_roundtrip() {
        let schema = Schema::parse("x:number|y:number").unwrap();
        assert_eq!(Schema::parse(&schema.header()).unwrap(), schema);
    }
}
