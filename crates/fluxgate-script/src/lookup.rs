//! Code-mapping lookup tables exposed to tenant scripts.
//!
//! Lookup resolution converts a source code to a mapped target code (and
//! back), optionally scoped to an organizational sub-unit. Resolution fails
//! closed: a missing mapping returns "not found" instead of raising, so a
//! gap in the table cannot abort a delivery unless the script decides it is
//! fatal.

use std::collections::HashMap;

/// A single named lookup table with forward and reverse resolution.
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
    scoped_forward: HashMap<(String, String), String>,
    scoped_reverse: HashMap<(String, String), String>,
}

impl LookupTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a global (unscoped) mapping.
    pub fn insert(&mut self, source: impl Into<String>, target: impl Into<String>) {
        let source = source.into();
        let target = target.into();
        self.reverse.insert(target.clone(), source.clone());
        self.forward.insert(source, target);
    }

    /// Insert a mapping scoped to an organizational sub-unit.
    ///
    /// Scoped mappings shadow the global mapping for the same source code.
    pub fn insert_scoped(
        &mut self,
        org_unit: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) {
        let unit = org_unit.into();
        let source = source.into();
        let target = target.into();
        self.scoped_reverse
            .insert((unit.clone(), target.clone()), source.clone());
        self.scoped_forward.insert((unit, source), target);
    }

    /// Resolve source → target. Unit-scoped mappings win over global ones.
    #[must_use]
    pub fn resolve(&self, source: &str, org_unit: Option<&str>) -> Option<&str> {
        if let Some(unit) = org_unit {
            if let Some(target) = self
                .scoped_forward
                .get(&(unit.to_string(), source.to_string()))
            {
                return Some(target.as_str());
            }
        }
        self.forward.get(source).map(String::as_str)
    }

    /// Resolve target → source (reverse direction).
    #[must_use]
    pub fn resolve_reverse(&self, target: &str, org_unit: Option<&str>) -> Option<&str> {
        if let Some(unit) = org_unit {
            if let Some(source) = self
                .scoped_reverse
                .get(&(unit.to_string(), target.to_string()))
            {
                return Some(source.as_str());
            }
        }
        self.reverse.get(target).map(String::as_str)
    }

    /// Number of global mappings in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Check whether the table holds no global mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

/// The set of lookup tables available to one script invocation.
#[derive(Debug, Clone, Default)]
pub struct LookupTables {
    tables: HashMap<String, LookupTable>,
}

impl LookupTables {
    /// Create an empty table set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named table, replacing any previous table with the same name.
    pub fn insert(&mut self, name: impl Into<String>, table: LookupTable) {
        self.tables.insert(name.into(), table);
    }

    /// Add a named table, builder style.
    #[must_use]
    pub fn with_table(mut self, name: impl Into<String>, table: LookupTable) -> Self {
        self.insert(name, table);
        self
    }

    /// Resolve source → target within a named table. Fails closed.
    #[must_use]
    pub fn resolve(&self, table: &str, source: &str, org_unit: Option<&str>) -> Option<String> {
        self.tables
            .get(table)
            .and_then(|t| t.resolve(source, org_unit))
            .map(ToString::to_string)
    }

    /// Resolve target → source within a named table. Fails closed.
    #[must_use]
    pub fn resolve_reverse(
        &self,
        table: &str,
        target: &str,
        org_unit: Option<&str>,
    ) -> Option<String> {
        self.tables
            .get(table)
            .and_then(|t| t.resolve_reverse(target, org_unit))
            .map(ToString::to_string)
    }
}
