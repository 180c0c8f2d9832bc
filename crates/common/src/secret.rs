//! Redacting wrapper for API keys and other credential material

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value. Debug and Display print `[REDACTED]`, the buffer is
/// zeroized on drop, and `expose` is the only way to read it.
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Borrow the inner value. Only outbound request construction should
    /// call this.
    pub fn expose(&self) -> &T {
        &self.0
    }

    /// Compare against a candidate without handing the inner value out.
    pub fn matches<U>(&self, candidate: &U) -> bool
    where
        T: PartialEq<U>,
        U: ?Sized,
    {
        self.0 == *candidate
    }
}

impl Secret<String> {
    /// True when the secret holds only whitespace (or nothing).
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
