//! Rule matching logic.
//!
//! Matches in-flight calls against a rule's service and method pattern.

use crate::config::MatchSpec;
use crate::error::ChaosError;
use crate::frame::Frame;
use regex::Regex;

/// Compiled predicate over a [`Frame`].
///
/// An empty service or an absent pattern matches anything.
#[derive(Debug, Clone)]
pub struct Matcher {
    /// Lower-cased service name
    service: String,
    /// Method pattern, unanchored and case-sensitive
    method: Option<Regex>,
}

impl Matcher {
    /// Compile a match spec.
    pub fn compile(spec: &MatchSpec) -> Result<Self, ChaosError> {
        let method = match spec.method_regex.as_deref() {
            None | Some("") => None,
            Some(pattern) => {
                Some(
                    Regex::new(pattern).map_err(|source| ChaosError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    })?,
                )
            }
        };

        Ok(Self {
            service: spec.service.to_lowercase(),
            method,
        })
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        self.matches_service(&frame.service) && self.matches_method(&frame.method)
    }

    fn matches_service(&self, service: &str) -> bool {
        self.service.is_empty() || self.service == service.to_lowercase()
    }

    fn matches_method(&self, method: &str) -> bool {
        match &self.method {
            Some(regex) => regex.is_match(method),
            None => true,
        }
    }

    /// The effective spec this matcher evaluates.
    pub fn to_spec(&self) -> MatchSpec {
        MatchSpec {
            service: self.service.clone(),
            method_regex: self.method.as_ref().map(|r| r.as_str().to_string()),
        }
    }
}
