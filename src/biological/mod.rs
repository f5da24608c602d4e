pub mod fieldlog;
pub mod fish;

use serde::Serialize;

/// Identity of a biological sample within its data type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum GroupKey {
    BySample(i64),
    BySampleAndHabitat(i64, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiologicalKind {
    Fish,
    Macro,
}

impl BiologicalKind {
    pub fn group_key(self, sample_id: i64, habitat: Option<String>) -> rusqlite::Result<GroupKey> {
        match (self, habitat) {
            (BiologicalKind::Fish, _) => Ok(GroupKey::BySample(sample_id)),
            (BiologicalKind::Macro, Some(habitat)) => {
                Ok(GroupKey::BySampleAndHabitat(sample_id, habitat))
            }
            (BiologicalKind::Macro, None) => Err(rusqlite::Error::InvalidParameterName(format!(
                "macroinvertebrate sample {sample_id} has no habitat"
            ))),
        }
    }
}

/// Name similarity in `[0, 1]`, 1 meaning identical.
pub trait Similarity {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Case-insensitive normalized Levenshtein ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizedLevenshtein;

impl Similarity for NormalizedLevenshtein {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
    }
}

impl<F> Similarity for F
where
    F: Fn(&str, &str) -> f64,
{
    fn similarity(&self, a: &str, b: &str) -> f64 {
        self(a, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntegrityClass {
    Excellent,
    Good,
    Fair,
    Poor,
    VeryPoor,
}

impl IntegrityClass {
    /// Class for a comparison-to-reference ratio.
    pub fn from_comparison(comparison: f64) -> Self {
        let percent = comparison * 100.0;
        if percent >= 97.0 {
            IntegrityClass::Excellent
        } else if percent >= 76.0 {
            IntegrityClass::Good
        } else if percent >= 60.0 {
            IntegrityClass::Fair
        } else if percent >= 47.0 {
            IntegrityClass::Poor
        } else {
            IntegrityClass::VeryPoor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            IntegrityClass::Excellent => "Excellent",
            IntegrityClass::Good => "Good",
            IntegrityClass::Fair => "Fair",
            IntegrityClass::Poor => "Poor",
            IntegrityClass::VeryPoor => "Very Poor",
        }
    }
}
