//! Seam to the operational-transform engine.
//!
//! Transforming concurrent edits against each other is an external
//! collaborator's job; the hub only needs a narrow contract:
//!
//! ```text
//! Document ── receive_operation(revision, op) ──► OtEngine
//!          ◄─ Ok(transformed op) / Err(OtError) ─┘
//! ```
//!
//! The engine owns the authoritative text and counts applied operations;
//! that count is the document's revision. A rejected operation is a typed
//! [`OtError`], which the document answers with a full-roster resync.
//!
//! [`LinearEngine`] is the shipped head-only implementation: it applies
//! ot.js-format component lists submitted at exactly the current revision
//! and reports everything else as a conflict. Serial editing works end to
//! end; real concurrent transformation plugs in behind [`OtEngineFactory`].

use serde_json::Value;
use thiserror::Error;

use crate::protocol::RawOperation;

/// Why the engine refused an operation.
#[derive(Debug, Error)]
pub enum OtError {
    #[error("revision {submitted} out of range (engine at {current})")]
    RevisionOutOfRange { submitted: u64, current: u64 },
    #[error("malformed operation: {0}")]
    Malformed(String),
}

/// The OT engine contract consumed by a document.
pub trait OtEngine: Send {
    /// Validate and apply an operation submitted against `revision`,
    /// returning the operation transformed to apply at the head.
    fn receive_operation(
        &mut self,
        revision: u64,
        operation: RawOperation,
    ) -> Result<RawOperation, OtError>;

    /// Current authoritative text.
    fn text(&self) -> &str;

    /// Count of applied operations since construction.
    fn revision(&self) -> u64;

    /// The insert-everything operation for init snapshots.
    fn snapshot(&self) -> RawOperation;
}

/// Builds an engine from freshly loaded document text.
pub trait OtEngineFactory: Send + Sync {
    fn create(&self, text: &str) -> Box<dyn OtEngine>;
}

/// Head-only engine: accepts operations only at the current revision.
///
/// Operations are ot.js component arrays: a positive integer retains that
/// many characters, a string inserts it, a negative integer deletes that
/// many characters. An operation must span the whole document.
pub struct LinearEngine {
    text: String,
    applied: u64,
}

impl LinearEngine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            applied: 0,
        }
    }
}

/// Factory for [`LinearEngine`].
pub struct LinearEngineFactory;

impl OtEngineFactory for LinearEngineFactory {
    fn create(&self, text: &str) -> Box<dyn OtEngine> {
        Box::new(LinearEngine::new(text))
    }
}

impl OtEngine for LinearEngine {
    fn receive_operation(
        &mut self,
        revision: u64,
        operation: RawOperation,
    ) -> Result<RawOperation, OtError> {
        if revision != self.applied {
            return Err(OtError::RevisionOutOfRange {
                submitted: revision,
                current: self.applied,
            });
        }
        self.text = apply_components(&self.text, &operation)?;
        self.applied += 1;
        Ok(operation)
    }

    fn text(&self) -> &str {
        &self.text
    }

    fn revision(&self) -> u64 {
        self.applied
    }

    fn snapshot(&self) -> RawOperation {
        if self.text.is_empty() {
            Value::Array(Vec::new())
        } else {
            serde_json::json!([self.text])
        }
    }
}

/// Apply an ot.js component array to `text`.
fn apply_components(text: &str, operation: &Value) -> Result<String, OtError> {
    let components = operation
        .as_array()
        .ok_or_else(|| OtError::Malformed("operation must be a component array".into()))?;

    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0usize;
    let mut out = String::with_capacity(text.len());

    for component in components {
        if let Some(insert) = component.as_str() {
            out.push_str(insert);
        } else if let Some(n) = component.as_i64() {
            if n > 0 {
                let len = n as usize;
                if pos + len > chars.len() {
                    return Err(OtError::Malformed(format!(
                        "retain {len} past end of document"
                    )));
                }
                out.extend(&chars[pos..pos + len]);
                pos += len;
            } else if n < 0 {
                let len = n.unsigned_abs() as usize;
                if pos + len > chars.len() {
                    return Err(OtError::Malformed(format!(
                        "delete {len} past end of document"
                    )));
                }
                pos += len;
            } else {
                return Err(OtError::Malformed("zero-length component".into()));
            }
        } else {
            return Err(OtError::Malformed(format!(
                "unsupported component: {component}"
            )));
        }
    }

    if pos != chars.len() {
        return Err(OtError::Malformed(
            "operation does not span the document".into(),
        ));
    }
    Ok(out)
}
