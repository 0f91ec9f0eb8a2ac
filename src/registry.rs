//! Prepared-statement registry.
//!
//! Populated by the scheduler as `Prepare` nodes complete; consulted by
//! `ExecutePrepared` nodes to recover the parameter OIDs and row description
//! that were fixed at prepare time.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::protocol::types::Oid;

/// A prepared statement as seen by the pipeline: the SQL text, the parameter
/// OIDs it was declared with, and the row description the server returned
/// while describing it (`None` for statements that return no rows).
#[derive(Debug, Clone)]
pub struct Definition {
    pub(crate) name: String,
    pub(crate) sql: String,
    pub(crate) param_oids: Vec<Oid>,
    pub(crate) row_desc: Option<Vec<u8>>,
}

impl Definition {
    /// The wire/statement name this definition was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SQL text passed to Parse.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Parameter OIDs the statement was parsed with.
    pub fn param_oids(&self) -> &[Oid] {
        &self.param_oids
    }
}

/// Tracks prepared statements that are currently valid on a connection.
///
/// A name is present iff its `Prepare` node received `ParseComplete` and no
/// error occurred before the enclosing `Sync`'s `ReadyForQuery`.
#[derive(Debug, Default)]
pub struct Registry {
    definitions: HashMap<String, Definition>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `name` is currently registered.
    pub fn has(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Insert (or overwrite) a definition. Re-preparing a name is idempotent:
    /// the latest definition simply replaces the old one.
    pub(crate) fn insert(&mut self, definition: Definition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    /// Look up a definition, failing with `UnknownPrepared` if absent.
    pub fn get(&self, name: &str) -> Result<&Definition> {
        self.definitions
            .get(name)
            .ok_or_else(|| Error::UnknownPrepared(name.to_string()))
    }
}
