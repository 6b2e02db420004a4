//! Phase descriptors
//!
//! A descriptor is the static, ordered phase list for one workflow type.
//! Phase ordering questions ("is coding before testing?") are answered by
//! index lookup here, never by enum ordering, so phases can be inserted
//! without breaking comparisons.

use serde::{Deserialize, Serialize};

use super::retry::RetryReason;
use crate::{Error, Result};

/// Reserved phase id a workflow's current phase is set to after the last
/// phase completes. Descriptors may not declare a phase with this id.
pub const PHASE_COMPLETED: &str = "completed";

/// Static, ordered phase list for a workflow type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDescriptor {
    /// Workflow type name (e.g. "dev-pipeline")
    name: String,
    /// Phases in execution order
    phases: Vec<PhaseSpec>,
}

/// One phase in a descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Phase id, lowercase (e.g. "planning")
    pub id: String,
    /// Optional display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Retry policy; present iff the phase is retry-eligible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

/// Retry policy for a retry-eligible phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Automated re-runs allowed before AutoFix is refused
    pub max_attempts: u32,
    /// Phase AutoFix rewinds to (must precede the failing phase)
    pub rewind_to: String,
    /// Classification used when the action raises without a structured report
    pub reason: RetryReason,
}

impl PhaseSpec {
    /// Create a phase with just an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            retry: None,
        }
    }

    /// Set a display title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Mark the phase retry-eligible
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Display title, falling back to the id
    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.id)
    }
}

impl PhaseDescriptor {
    /// Create a descriptor, validating the phase list
    pub fn new(name: impl Into<String>, phases: Vec<PhaseSpec>) -> Result<Self> {
        let name = name.into();

        if phases.is_empty() {
            return Err(Error::Config(format!(
                "Workflow '{}' has no phases",
                name
            )));
        }

        for (i, spec) in phases.iter().enumerate() {
            if spec.id == PHASE_COMPLETED {
                return Err(Error::Config(format!(
                    "Phase id '{}' is reserved",
                    PHASE_COMPLETED
                )));
            }
            if phases[..i].iter().any(|p| p.id == spec.id) {
                return Err(Error::Config(format!("Duplicate phase id '{}'", spec.id)));
            }
            if let Some(retry) = &spec.retry {
                if retry.max_attempts == 0 {
                    return Err(Error::Config(format!(
                        "Phase '{}': max_attempts must be at least 1",
                        spec.id
                    )));
                }
                let target = phases.iter().position(|p| p.id == retry.rewind_to);
                match target {
                    Some(t) if t < i => {}
                    Some(_) => {
                        return Err(Error::Config(format!(
                            "Phase '{}': rewind target '{}' must precede it",
                            spec.id, retry.rewind_to
                        )));
                    }
                    None => {
                        return Err(Error::Config(format!(
                            "Phase '{}': unknown rewind target '{}'",
                            spec.id, retry.rewind_to
                        )));
                    }
                }
            }
        }

        Ok(Self { name, phases })
    }

    /// Workflow type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Phases in execution order
    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    /// Phase ids in execution order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.id.as_str())
    }

    /// Number of phases
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// True when the descriptor has no phases (never after validation)
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Position of a phase in execution order
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    /// Phase at a position
    pub fn get(&self, index: usize) -> Option<&PhaseSpec> {
        self.phases.get(index)
    }

    /// Spec for a phase id
    pub fn spec(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// Check if a phase exists
    pub fn has_phase(&self, id: &str) -> bool {
        self.phases.iter().any(|p| p.id == id)
    }

    /// The phase after the given one, if any
    pub fn next_after(&self, id: &str) -> Option<&str> {
        self.index_of(id)
            .and_then(|i| self.phases.get(i + 1))
            .map(|p| p.id.as_str())
    }

    /// True when phase `a` comes before phase `b`
    pub fn precedes(&self, a: &str, b: &str) -> bool {
        match (self.index_of(a), self.index_of(b)) {
            (Some(ia), Some(ib)) => ia < ib,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_phase() -> PhaseDescriptor {
        PhaseDescriptor::new(
            "test",
            vec![
                PhaseSpec::new("plan"),
                PhaseSpec::new("code"),
                PhaseSpec::new("review"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_ordering_lookups() {
        let d = three_phase();
        assert_eq!(d.index_of("plan"), Some(0));
        assert_eq!(d.index_of("review"), Some(2));
        assert_eq!(d.index_of("missing"), None);
        assert_eq!(d.next_after("plan"), Some("code"));
        assert_eq!(d.next_after("review"), None);
        assert!(d.precedes("plan", "review"));
        assert!(!d.precedes("review", "plan"));
        assert!(!d.precedes("plan", "missing"));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let err = PhaseDescriptor::new(
            "dup",
            vec![PhaseSpec::new("a"), PhaseSpec::new("a")],
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_reserved_id() {
        let err = PhaseDescriptor::new("bad", vec![PhaseSpec::new(PHASE_COMPLETED)]);
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(PhaseDescriptor::new("empty", vec![]).is_err());
    }

    #[test]
    fn test_retry_rewind_must_precede() {
        let forward = PhaseDescriptor::new(
            "bad-rewind",
            vec![
                PhaseSpec::new("code"),
                PhaseSpec::new("test").with_retry(RetryPolicy {
                    max_attempts: 3,
                    rewind_to: "review".to_string(),
                    reason: RetryReason::TestsFailed,
                }),
                PhaseSpec::new("review"),
            ],
        );
        assert!(forward.is_err());

        let ok = PhaseDescriptor::new(
            "good-rewind",
            vec![
                PhaseSpec::new("code"),
                PhaseSpec::new("test").with_retry(RetryPolicy {
                    max_attempts: 3,
                    rewind_to: "code".to_string(),
                    reason: RetryReason::TestsFailed,
                }),
            ],
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn test_title_falls_back_to_id() {
        let spec = PhaseSpec::new("plan");
        assert_eq!(spec.title(), "plan");
        let titled = PhaseSpec::new("plan").with_title("Planning");
        assert_eq!(titled.title(), "Planning");
    }
}
