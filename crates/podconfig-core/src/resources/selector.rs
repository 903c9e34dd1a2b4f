use crate::error::{PodConfigError, Result};
use std::collections::BTreeMap;

/// A single selector requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
}

/// Equality-based label selector (`k=v`, `k==v`, `k!=v`, `k`), comma-separated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn parse(selector: &str) -> Result<Self> {
        let mut requirements = Vec::new();

        for part in selector.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(PodConfigError::invalid_selector(
                    selector,
                    "empty requirement",
                ));
            }

            let requirement = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==") {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once('=') {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else {
                Requirement::Exists(part.to_string())
            };

            let key = match &requirement {
                Requirement::Equals(k, _) | Requirement::NotEquals(k, _) => k,
                Requirement::Exists(k) => k,
            };
            if key.is_empty() || key.contains(char::is_whitespace) {
                return Err(PodConfigError::invalid_selector(
                    selector,
                    format!("invalid key in '{}'", part),
                ));
            }

            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| match r {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
        })
    }

    /// Labels that satisfy this selector. Only equality requirements can be
    /// turned into labels.
    pub fn equality_labels(&self, original: &str) -> Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        for r in &self.requirements {
            match r {
                Requirement::Equals(k, v) => {
                    labels.insert(k.clone(), v.clone());
                }
                _ => {
                    return Err(PodConfigError::invalid_selector(
                        original,
                        "sample workloads need a selector made only of key=value requirements",
                    ))
                }
            }
        }
        Ok(labels)
    }
}
