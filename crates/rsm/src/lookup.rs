//! Query results with single release.

use std::fmt;

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Bytes returned by a query. The holder owns them.
///
/// An optional release hook runs exactly once, when the result is dropped or
/// consumed, whichever path the holder takes.
pub struct LookupResult {
    data: Vec<u8>,
    release: Option<ReleaseHook>,
}

impl LookupResult {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            release: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// A result that calls `release` once the caller is done with it.
    pub fn with_release(data: impl Into<Vec<u8>>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            data: data.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the bytes; the release hook runs now.
    pub fn into_bytes(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Release explicitly. Equivalent to dropping.
    pub fn release(self) {}
}

impl Drop for LookupResult {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LookupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupResult")
            .field("len", &self.data.len())
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

impl PartialEq<[u8]> for LookupResult {
    fn eq(&self, other: &[u8]) -> bool {
        self.data == other
    }
}

impl PartialEq<&str> for LookupResult {
    fn eq(&self, other: &&str) -> bool {
        self.data == other.as_bytes()
    }
}
