use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical operation kind, independent of the connector's encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    /// Row created (`c` / `create`)
    Insert,
    /// Row changed (`u` / `update`)
    Update,
    /// Row removed (`d` / `delete`)
    Delete,
    /// Row emitted by the initial snapshot (`r` / `read`)
    Snapshot,
    /// Anything else the connector sent (truncate, message, future codes)
    Unknown,
}

impl OperationKind {
    pub const KNOWN: [OperationKind; 4] = [
        OperationKind::Insert,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::Snapshot => "SNAPSHOT",
            OperationKind::Unknown => "UNKNOWN",
        }
    }

    /// Check if operation modifies data (excludes Snapshot and Unknown)
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a connector operation code to its canonical kind.
///
/// Both the single-letter and the full-word encodings are accepted at the same
/// time; each alias set covers the same four kinds, so they cannot disagree.
/// Matching is exact and case-sensitive.
pub fn classify(code: &str) -> OperationKind {
    match code {
        "c" | "create" => OperationKind::Insert,
        "u" | "update" => OperationKind::Update,
        "d" | "delete" => OperationKind::Delete,
        "r" | "read" => OperationKind::Snapshot,
        _ => OperationKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_letter_codes() {
        assert_eq!(classify("c"), OperationKind::Insert);
        assert_eq!(classify("u"), OperationKind::Update);
        assert_eq!(classify("d"), OperationKind::Delete);
        assert_eq!(classify("r"), OperationKind::Snapshot);
    }

    #[test]
    fn test_full_word_codes() {
        assert_eq!(classify("create"), OperationKind::Insert);
        assert_eq!(classify("update"), OperationKind::Update);
        assert_eq!(classify("delete"), OperationKind::Delete);
        assert_eq!(classify("read"), OperationKind::Snapshot);
    }

    #[test]
    fn test_alias_sets_agree() {
        for (short, long) in [("c", "create"), ("u", "update"), ("d", "delete"), ("r", "read")] {
            assert_eq!(classify(short), classify(long));
        }
    }

    #[test]
    fn test_unrecognized_codes_are_unknown() {
        for code in ["", "t", "m", "C", "Create", "insert", " c", "snapshot", "x"] {
            assert_eq!(classify(code), OperationKind::Unknown, "code {:?}", code);
        }
    }

    #[test]
    fn test_every_known_kind_is_reachable() {
        let reached: Vec<_> = ["c", "u", "d", "r"].into_iter().map(classify).collect();
        assert_eq!(reached, OperationKind::KNOWN.to_vec());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(OperationKind::Insert.to_string(), "INSERT");
        assert_eq!(OperationKind::Snapshot.to_string(), "SNAPSHOT");
        assert!(!OperationKind::Snapshot.is_mutating());
        assert!(OperationKind::Delete.is_mutating());
    }
}
