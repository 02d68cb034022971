//!
//! # Failure Classification
//!
//! Decides whether a failed command dispatch may be retried.
//!
//! A failure is captured as a [`FailureRecord`]: the chain of failure kinds
//! observed at the moment of the failure, outermost first. A
//! [`FailureClassifier`] maps that chain to retryable / non-retryable.
//!
//! The default classifier is [`RetryableKinds`], a safelist: a record is
//! retryable only if one of its kinds was explicitly configured as transient.
//! Unknown failures are therefore never retried.
//!

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Identifier of one kind of failure (e.g. `"ConnectionReset"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailureKind(String);

impl FailureKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FailureKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for FailureKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

/// Snapshot of a failure's kind chain, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    kinds: Vec<FailureKind>,
    captured_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Capture a kind chain now.
    pub fn new<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<FailureKind>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            captured_at: Utc::now(),
        }
    }

    /// The kind chain, outermost first.
    #[inline]
    pub fn kinds(&self) -> &[FailureKind] {
        &self.kinds
    }

    #[inline]
    pub fn outermost(&self) -> Option<&FailureKind> {
        self.kinds.first()
    }

    #[inline]
    pub fn contains(&self, kind: &FailureKind) -> bool {
        self.kinds.contains(kind)
    }

    #[inline]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: Vec<&str> = self.kinds.iter().map(FailureKind::as_str).collect();
        write!(f, "[{}]", chain.join(" <- "))
    }
}

/// Maps a failure record to retryable / non-retryable.
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    fn is_retryable(&self, failure: &FailureRecord) -> bool;
}

/// Safelist classifier: retryable iff any kind in the chain is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryableKinds {
    kinds: HashSet<FailureKind>,
}

impl RetryableKinds {
    pub fn new<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<FailureKind>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }

    /// Add one more retryable kind.
    pub fn with_kind(mut self, kind: impl Into<FailureKind>) -> Self {
        self.kinds.insert(kind.into());
        self
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl FailureClassifier for RetryableKinds {
    fn is_retryable(&self, failure: &FailureRecord) -> bool {
        failure.kinds().iter().any(|kind| self.kinds.contains(kind))
    }
}

/// Blocklist classifier: everything is retryable except chains containing
/// one of the configured non-transient kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonTransientKinds {
    kinds: HashSet<FailureKind>,
}

impl NonTransientKinds {
    pub fn new<I, K>(kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<FailureKind>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

impl FailureClassifier for NonTransientKinds {
    fn is_retryable(&self, failure: &FailureRecord) -> bool {
        !failure.kinds().iter().any(|kind| self.kinds.contains(kind))
    }
}

/// Classifier backed by an arbitrary predicate.
#[derive(Clone)]
pub struct PredicateClassifier {
    name: String,
    predicate: Arc<dyn Fn(&FailureRecord) -> bool + Send + Sync>,
}

impl PredicateClassifier {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&FailureRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for PredicateClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl FailureClassifier for PredicateClassifier {
    fn is_retryable(&self, failure: &FailureRecord) -> bool {
        (self.predicate)(failure)
    }
}
