/// Which size parameters a completion model accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    /// `max_completion_tokens`, no temperature
    Newer,
    /// `max_tokens` plus `temperature`
    Legacy,
}

const NEWER_MODEL_FRAGMENTS: &[&str] = &["gpt-5", "gpt-4.1", "o1", "o3", "o4"];

/// Model-name fragments that take the newer request shape; anything else is legacy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFamilyTable {
    newer: Vec<String>,
}

impl Default for ModelFamilyTable {
    fn default() -> Self {
        Self {
            newer: NEWER_MODEL_FRAGMENTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ModelFamilyTable {
    /// The default table with `extra` fragments checked first
    pub fn with_extra(extra: &[String]) -> Self {
        let mut newer: Vec<String> = extra
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        newer.extend(Self::default().newer);
        Self { newer }
    }

    pub fn shape_for(&self, model: &str) -> RequestShape {
        let model = model.to_lowercase();
        if self.newer.iter().any(|fragment| model.contains(fragment.as_str())) {
            RequestShape::Newer
        } else {
            RequestShape::Legacy
        }
    }
}
