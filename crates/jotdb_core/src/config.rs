//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether all write operations are rejected.
    pub read_only: bool,

    /// Number of encoded records concatenated per physical append.
    pub append_buffer: usize,

    /// How long counter mutations may sit in RAM before a flush.
    pub counter_flush: Duration,

    /// Whether removed and rewritten lines are copied to the backup sidecar.
    pub backup: bool,

    /// User name stamped into backup sidecar lines.
    pub backup_user: String,

    /// Whether operations are appended to the human-readable log sidecar.
    pub log: bool,

    /// Schema definition for tables, e.g. `"id:string|age:number"`.
    ///
    /// Ignored by document databases. A table whose file does not yet exist
    /// uses this definition; a table with neither file nor schema fails
    /// every operation with `SchemaMissing`.
    pub schema: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_only: false,
            append_buffer: 20,
            counter_flush: Duration::from_secs(30),
            backup: false,
            backup_user: String::new(),
            log: false,
            schema: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether the database is read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets the append batch size.
    #[must_use]
    pub const fn append_buffer(mut self, records: usize) -> Self {
        self.append_buffer = records;
        self
    }

    /// Sets the counter flush debounce.
    #[must_use]
    pub const fn counter_flush(mut self, interval: Duration) -> Self {
        self.counter_flush = interval;
        self
    }

    /// Enables the backup sidecar with the given user name.
    #[must_use]
    pub fn backup_to(mut self, user: impl Into<String>) -> Self {
        self.backup = true;
        self.backup_user = user.into();
        self
    }

    /// Enables the operation log sidecar.
    #[must_use]
    pub const fn log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Sets the table schema definition.
    #[must_use]
    pub fn schema(mut self, definition: impl Into<String>) -> Self {
        self.schema = Some(definition.into());
        self
    }
}
