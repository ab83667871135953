//! Parser for the `JVM_DEPENDENCIES` job output.
//!
//! The analyzer reports dependencies as comma separated entries, each entry
//! being `coordinate;source[;key=value...]`:
//!
//! ```text
//! g:a:1;maven;k1=v1,g:a:2;null
//! ```

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::types::DependencyRecord;

const ENTRY_DELIMITER: char = ',';
const FIELD_DELIMITER: char = ';';
const ATTRIBUTE_DELIMITER: char = '=';

/// Source value the analyzer uses when it could not determine one.
const NULL_SOURCE: &str = "null";

/// Source recorded instead of [`NULL_SOURCE`].
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Parse a dependency list into records, preserving input order and duplicates.
///
/// Entries with fewer than two fields are dropped. Attribute pairs without a
/// key are dropped while the record itself is kept.
pub fn parse_dependencies(raw: &str) -> Vec<DependencyRecord> {
    raw.split(ENTRY_DELIMITER)
        .filter(|entry| !entry.is_empty())
        .filter_map(parse_entry)
        .collect_vec()
}

fn parse_entry(entry: &str) -> Option<DependencyRecord> {
    let mut fields = entry.split(FIELD_DELIMITER);
    let coordinate = fields.next()?;
    let source = match fields.next()? {
        NULL_SOURCE => UNKNOWN_SOURCE,
        other => other,
    };

    let attributes = fields.filter_map(parse_attribute).collect::<BTreeMap<_, _>>();

    Some(DependencyRecord {
        coordinate: coordinate.to_string(),
        source: source.to_string(),
        attributes,
    })
}

fn parse_attribute(pair: &str) -> Option<(String, String)> {
    // split on the first '=' only; values may contain more
    match pair.split_once(ATTRIBUTE_DELIMITER) {
        Some((key, value)) if !key.is_empty() => Some((key.to_string(), value.to_string())),
        _ => None,
    }
}
