// /////////////////////////////////////////////////////////////////////////////
// BB-Pipeline Core
// SPDX-License-Identifier: BSD-3-Clause
// /////////////////////////////////////////////////////////////////////////////

//! Parsed CSV row value object (spec.md §3, §4.6).

use std::collections::HashMap;

/// One CSV data row, produced by the streaming parser's state machine.
/// `row_number` is 1-based and counts data rows only (the header, if
/// present, is row 0 and is not itself a `ParsedRow`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRow {
    pub row_number: u64,
    pub fields: Vec<String>,
    header: Option<Vec<String>>,
}

impl ParsedRow {
    pub fn new(row_number: u64, fields: Vec<String>, header: Option<Vec<String>>) -> Self {
        Self { row_number, fields, header }
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Looks up a field by header column name, case-sensitively. Returns
    /// `None` when there is no header or the column doesn't exist.
    pub fn field_by_name(&self, name: &str) -> Option<&str> {
        let header = self.header.as_ref()?;
        let index = header.iter().position(|h| h == name)?;
        self.field(index)
    }

    pub fn header_index_map(&self) -> HashMap<String, usize> {
        self.header
            .as_ref()
            .map(|h| h.iter().cloned().enumerate().map(|(i, name)| (name, i)).collect())
            .unwrap_or_default()
    }

    pub fn column_count(&self) -> usize {
        self.fields.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_by_name_resolves_through_header() {
        let row = ParsedRow::new(1, vec!["example.com".into(), "200".into()], Some(vec!["url".into(), "status".into()]));
        assert_eq!(row.field_by_name("status"), Some("200"));
        assert_eq!(row.field_by_name("missing"), None);
    }

    #[test]
    fn header_index_map_is_empty_without_header() {
        let row = ParsedRow::new(1, vec!["a".into()], None);
        assert!(row.header_index_map().is_empty());
    }
}
