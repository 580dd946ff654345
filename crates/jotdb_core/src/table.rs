//! Fixed-schema tables.

use crate::config::Config;
use crate::database::Database;
use crate::dir::DirKind;
use crate::error::{CoreError, CoreResult};
use crate::scheduler::Pending;
use jotdb_codec::Schema;
use std::ops::Deref;
use std::path::Path;

/// A database of fixed-schema, pipe-delimited rows.
///
/// `Table` specializes [`Database`]: rows encode through the table codec,
/// the file's first line is the schema header, and the schema can be
/// extended live. Every document operation is available through `Deref`.
///
/// ```rust,ignore
/// let table = Table::open(root, "users", Config::new().schema("id:string|age:number"))?;
/// table.insert(json!({"id": "a", "age": 31})).wait()?;
/// ```
pub struct Table {
    db: Database,
}

impl Table {
    /// Opens a table under `root`.
    ///
    /// An existing file supplies the schema from its header line;
    /// otherwise `config.schema` is used. A table with neither fails
    /// every operation with [`CoreError::SchemaMissing`].
    pub fn open(root: &Path, name: &str, config: Config) -> CoreResult<Self> {
        let db = Database::open_kind(root, name, config, DirKind::Table)?;
        Ok(Self { db })
    }

    /// The current schema, if one is known.
    #[must_use]
    pub fn schema(&self) -> Option<Schema> {
        self.db.schema()
    }

    /// Replaces the schema, rewriting every row through the new codec.
    ///
    /// Runs exclusively: the whole file streams through the old schema's
    /// decoder into a staging file with the new header, which then
    /// replaces the original. Dropping columns is allowed and discards
    /// their cells.
    pub fn extend(&self, definition: &str) -> Pending<usize> {
        match Schema::parse(definition) {
            Ok(schema) => self.db.extend_schema(schema),
            Err(e) => crate::scheduler::resolved(Err(CoreError::from(e))),
        }
    }

    /// Consumes the table, closing the underlying database.
    pub fn close(self) -> CoreResult<()> {
        self.db.close()
    }
}

impl Deref for Table {
    type Target = Database;

    fn deref(&self) -> &Database {
        &self.db
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.db.name())
            .field("schema", &self.schema().map(|s| s.header()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use serde_json::json;
    use tempfile::tempdir;

    fn open_table(dir: &tempfile::TempDir, schema: &str) -> Table {
        Table::open(dir.path(), "rows", Config::new().schema(schema)).unwrap()
    }

    #[test]
    fn header_written_on_first_insert() {
        let temp = tempdir().unwrap();
        let table = open_table(&temp, "id:string|n:number");

        table.insert(json!({"id": "a", "n": 1})).wait().unwrap();

        let content = std::fs::read_to_string(temp.path().join("rows.table")).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("id:string|n:number"));
        assert_eq!(lines.next(), Some("+|a|1"));
    }

    #[test]
    fn schema_loaded_from_existing_file() {
        let temp = tempdir().unwrap();
        {
            let table = open_table(&temp, "id:string|n:number");
            table.insert(json!({"id": "a", "n": 2})).wait().unwrap();
            table.close().unwrap();
        }

        // No schema in the config; the header supplies it.
        let table = Table::open(temp.path(), "rows", Config::default()).unwrap();
        assert_eq!(table.schema().unwrap().header(), "id:string|n:number");

        let docs = table.find(Query::new()).wait().unwrap();
        assert_eq!(docs, vec![json!({"id": "a", "n": 2})]);
    }

    #[test]
    fn missing_schema_fails_writes() {
        let temp = tempdir().unwrap();
        let table = Table::open(temp.path(), "rows", Config::default()).unwrap();

        let err = table.insert(json!({"id": "a"})).wait().unwrap_err();
        assert!(matches!(err, CoreError::SchemaMissing));
    }

    #[test]
    fn update_preserves_length_through_tombstone() {
        let temp = tempdir().unwrap();
        let table = open_table(&temp, "id:string|name:string");
        table
            .insert(json!({"id": "a", "name": "first"}))
            .wait()
            .unwrap();

        table
            .update(
                Query::new().where_("id", "==", "a"),
                crate::scheduler::Modify::Merge(json!({"name": "a much longer name"})),
            )
            .wait()
            .unwrap();

        let content = std::fs::read_to_string(temp.path().join("rows.table")).unwrap();
        assert!(content.contains("\n-|a|first\n"));
        assert!(content.ends_with("+|a|a much longer name\n"));

        let docs = table.find(Query::new()).wait().unwrap();
        assert_eq!(docs, vec![json!({"id": "a", "name": "a much longer name"})]);
    }

    #[test]
    fn remove_tombstones_and_clean_drops() {
        let temp = tempdir().unwrap();
        let table = open_table(&temp, "id:string");
        table.insert(json!({"id": "a"})).wait().unwrap();
        table.insert(json!({"id": "b"})).wait().unwrap();

        let removed = table
            .remove(Query::new().where_("id", "==", "a"))
            .wait()
            .unwrap();
        assert_eq!(removed, 1);

        let content = std::fs::read_to_string(temp.path().join("rows.table")).unwrap();
        assert!(content.contains("-|a"));

        table.clean().wait().unwrap();
        let content = std::fs::read_to_string(temp.path().join("rows.table")).unwrap();
        assert!(!content.contains("-|a"));
        assert!(content.starts_with("id:string\n"));
    }

    #[test]
    fn extend_adds_and_drops_columns() {
        let temp = tempdir().unwrap();
        let table = open_table(&temp, "id:string|legacy:string");
        table
            .insert(json!({"id": "a", "legacy": "x"}))
            .wait()
            .unwrap();

        table.extend("id:string|age:number").wait().unwrap();
        assert_eq!(table.schema().unwrap().header(), "id:string|age:number");

        let content = std::fs::read_to_string(temp.path().join("rows.table")).unwrap();
        assert!(content.starts_with("id:string|age:number\n"));

        // Old rows lose the dropped column and gain the new empty one.
        let docs = table.find(Query::new()).wait().unwrap();
        assert_eq!(docs, vec![json!({"id": "a"})]);

        table
            .insert(json!({"id": "b", "age": 7}))
            .wait()
            .unwrap();
        let docs = table
            .find(Query::new().where_("age", ">", 0))
            .wait()
            .unwrap();
        assert_eq!(docs, vec![json!({"id": "b", "age": 7})]);
    }

    #[test]
    fn clear_reemits_header() {
        let temp = tempdir().unwrap();
        let table = open_table(&temp, "id:string");
        table.insert(json!({"id": "a"})).wait().unwrap();

        table.clear().wait().unwrap();
        let content = std::fs::read_to_string(temp.path().join("rows.table")).unwrap();
        assert_eq!(content, "id:string\n");
    }

    #[test]
    fn escaped_rows_roundtrip_through_engine() {
        let temp = tempdir().unwrap();
        let table = open_table(&temp, "id:string|name:string|meta:object");
        let doc = json!({"id": "r1", "name": "a|b", "meta": {"x": "y\n"}});
        table.insert(doc.clone()).wait().unwrap();

        let content = std::fs::read_to_string(temp.path().join("rows.table")).unwrap();
        assert!(content.lines().nth(1).unwrap().starts_with('*'));

        let docs = table.find(Query::new()).wait().unwrap();
        assert_eq!(docs, vec![doc]);
    }
}
