//! Handling of secret values.
//!
//! This module provides a `Secret<T>` ensuring that passwords, SASL
//! continuation payloads, and similar sensitive values are not
//! `Debug`-printed (or logged) by accident.

use std::fmt::{Debug, Formatter};

/// A wrapper to ensure that secrets are redacted during `Debug`-printing.
#[derive(Clone, Default, Eq, Hash, PartialEq)]
pub struct Secret<T>(T);

impl<T> Secret<T> {
    /// Create a new secret.
    pub fn new(inner: T) -> Self {
        Self(inner)
    }

    /// Expose the inner secret.
    pub fn declassify(&self) -> &T {
        &self.0
    }

    /// Consume the wrapper, exposing the inner secret.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Secret<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T> Debug for Secret<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "/* REDACTED */")
    }
}
