//! Pipeline stage identifiers.

use serde::{Deserialize, Serialize};

/// Identifier of one pipeline stage.
///
/// The set is closed: adding a stage means adding a variant and a routing
/// entry, not runtime polymorphism. Stages run strictly in the order
/// returned by [`StageId::ordered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    /// Preprocessing / text extraction.
    Extract,
    /// Visual / OCR enrichment.
    Visual,
    /// Formatting (deterministic cleanup and merge).
    Format,
    /// Structuring (normalized text + structured JSON).
    Structure,
    /// Synthesis (summary, tags).
    Synthesize,
    /// Chunking.
    Chunk,
    /// Embedding.
    Embed,
}

impl StageId {
    /// All stages in execution order.
    pub fn ordered() -> [StageId; 7] {
        [
            Self::Extract,
            Self::Visual,
            Self::Format,
            Self::Structure,
            Self::Synthesize,
            Self::Chunk,
            Self::Embed,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Visual => "visual",
            Self::Format => "format",
            Self::Structure => "structure",
            Self::Synthesize => "synthesize",
            Self::Chunk => "chunk",
            Self::Embed => "embed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "extract" => Some(Self::Extract),
            "visual" => Some(Self::Visual),
            "format" => Some(Self::Format),
            "structure" => Some(Self::Structure),
            "synthesize" => Some(Self::Synthesize),
            "chunk" => Some(Self::Chunk),
            "embed" => Some(Self::Embed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        for stage in StageId::ordered() {
            assert_eq!(StageId::from_str(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn test_stage_from_invalid() {
        assert_eq!(StageId::from_str("unknown"), None);
        assert_eq!(StageId::from_str(""), None);
    }

    #[test]
    fn test_ordering_is_stable() {
        let order = StageId::ordered();
        assert_eq!(order[0], StageId::Extract);
        assert_eq!(order[6], StageId::Embed);
    }
}
