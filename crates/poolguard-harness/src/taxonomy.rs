//! Machine-readable violation taxonomy.

use serde::Serialize;

use poolguard_membrane::ViolationKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaxonomyEntry {
    pub code: u32,
    pub symbol: &'static str,
    pub description: &'static str,
    pub warning: bool,
    /// Default CWE id, absent when the kind has none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwe: Option<u16>,
}

/// Every violation kind in code order.
#[must_use]
pub fn taxonomy() -> Vec<TaxonomyEntry> {
    ViolationKind::ALL
        .into_iter()
        .map(|kind| TaxonomyEntry {
            code: kind.code(),
            symbol: kind.symbol(),
            description: kind.description(),
            warning: kind.is_warning(),
            cwe: kind.default_cwe().map(|cwe| cwe.id()),
        })
        .collect()
}
