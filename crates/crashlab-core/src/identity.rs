//! Build identity
//!
//! Revision, branch and build time of the running binary, plus a tag string
//! bracketed by sentinel markers. A snapshot found later can be matched to
//! the exact build with a literal search for [`TAG_BEGIN`], even in a
//! stripped binary or a raw artifact with no symbol information.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

use thiserror::Error;

/// Opening sentinel of the tag string
pub const TAG_BEGIN: &str = "<<<BUILDTAG>>>";
/// Closing sentinel of the tag string
pub const TAG_END: &str = "<<<END_BUILDTAG>>>";

/// Identity errors
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Build identity already installed (revision {revision})")]
    AlreadyInstalled { revision: String },
}

/// Process-wide slot, written once by [`BuildIdentity::install`]
static INSTALLED: OnceLock<BuildIdentity> = OnceLock::new();

/// Address of the installed tag bytes.
///
/// Exported and marked `#[used]` so neither the optimizer nor the linker can
/// drop it; a debugger or core-dump reader can follow it by symbol name.
#[no_mangle]
#[used]
pub static CRASHLAB_BUILD_TAG_PTR: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());

/// Length in bytes of the tag behind [`CRASHLAB_BUILD_TAG_PTR`]
#[no_mangle]
#[used]
pub static CRASHLAB_BUILD_TAG_LEN: AtomicUsize = AtomicUsize::new(0);

/// Build metadata of the running binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildIdentity {
    revision: String,
    branch: String,
    timestamp: String,
    tag: String,
}

impl BuildIdentity {
    /// Create an identity from the three externally supplied strings
    pub fn new(
        revision: impl Into<String>,
        branch: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        let revision = revision.into();
        let branch = branch.into();
        let timestamp = timestamp.into();
        let tag = format!(
            "{} Rev:{} Branch:{} Built:{} {}",
            TAG_BEGIN, revision, branch, timestamp, TAG_END
        );
        Self {
            revision,
            branch,
            timestamp,
            tag,
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// The sentinel-delimited tag string
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Recover an identity from a tag string produced by [`BuildIdentity::tag`]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let body = tag
            .trim()
            .strip_prefix(TAG_BEGIN)?
            .strip_suffix(TAG_END)?
            .trim();
        let rest = body.strip_prefix("Rev:")?;
        let (revision, rest) = rest.split_once(" Branch:")?;
        let (branch, timestamp) = rest.split_once(" Built:")?;
        Some(Self::new(revision, branch, timestamp))
    }

    /// Place this identity in the process-wide slot.
    ///
    /// The slot is written exactly once; later calls fail and leave the
    /// installed identity untouched.
    pub fn install(identity: BuildIdentity) -> Result<&'static BuildIdentity, IdentityError> {
        let mut ours = false;
        let installed = INSTALLED.get_or_init(|| {
            ours = true;
            identity
        });
        if !ours {
            return Err(IdentityError::AlreadyInstalled {
                revision: installed.revision.clone(),
            });
        }

        CRASHLAB_BUILD_TAG_LEN.store(installed.tag.len(), Ordering::SeqCst);
        CRASHLAB_BUILD_TAG_PTR.store(installed.tag.as_ptr() as *mut u8, Ordering::SeqCst);
        std::hint::black_box(&CRASHLAB_BUILD_TAG_PTR);

        log::debug!("Installed build identity: {}", installed.tag);
        Ok(installed)
    }

    /// The installed identity, if any
    pub fn current() -> Option<&'static BuildIdentity> {
        INSTALLED.get()
    }
}

/// Read the tag back through the exported pointer
pub fn published_tag() -> Option<&'static str> {
    let ptr = CRASHLAB_BUILD_TAG_PTR.load(Ordering::SeqCst);
    if ptr.is_null() {
        return None;
    }
    let len = CRASHLAB_BUILD_TAG_LEN.load(Ordering::SeqCst);
    // SAFETY: the pointer and length are only ever stored from the tag of
    // the identity held in `INSTALLED`, which is never dropped or mutated.
    let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
    std::str::from_utf8(bytes).ok()
}

/// Longest tag accepted by [`find_tag`]
const MAX_TAG_LEN: usize = 1024;

/// Locate a tag inside an arbitrary byte buffer.
///
/// Returns the text from the opening sentinel through the closing one.
/// Sentinels that do not enclose a well-formed tag (the bare constants in a
/// binary, for instance) are skipped.
pub fn find_tag(bytes: &[u8]) -> Option<&str> {
    let mut from = 0;
    while let Some(start) = find_subslice(bytes, TAG_BEGIN.as_bytes(), from) {
        from = start + TAG_BEGIN.len();
        let Some(end) = find_subslice(bytes, TAG_END.as_bytes(), from) else {
            return None;
        };
        let end = end + TAG_END.len();
        if end - start > MAX_TAG_LEN {
            continue;
        }
        if let Ok(tag) = std::str::from_utf8(&bytes[start..end]) {
            let nested = tag[TAG_BEGIN.len()..].contains(TAG_BEGIN);
            if !nested && BuildIdentity::from_tag(tag).is_some() {
                return Some(tag);
            }
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_format() {
        let id = BuildIdentity::new("a1b2c3d", "feature/my-fix", "2024-05-01T10:00:00");
        assert_eq!(
            id.tag(),
            "<<<BUILDTAG>>> Rev:a1b2c3d Branch:feature/my-fix Built:2024-05-01T10:00:00 <<<END_BUILDTAG>>>"
        );
        assert_eq!(id.revision(), "a1b2c3d");
        assert_eq!(id.branch(), "feature/my-fix");
        assert_eq!(id.timestamp(), "2024-05-01T10:00:00");
    }

    #[test]
    fn test_from_tag() {
        let id = BuildIdentity::new("deadbeef", "main", "2024-05-01 10:00:00");
        let parsed = BuildIdentity::from_tag(id.tag()).unwrap();
        assert_eq!(parsed, id);
        assert!(BuildIdentity::from_tag("Rev:x Branch:y Built:z").is_none());
    }

    #[test]
    fn test_find_tag_in_noise() {
        let id = BuildIdentity::new("1234567", "release/1.0", "now");
        let mut blob = vec![0u8, 0xff, 0x13, 0x37];
        blob.extend_from_slice(b"garbage<<<BUILD");
        blob.extend_from_slice(id.tag().as_bytes());
        blob.extend_from_slice(&[0u8; 16]);
        assert_eq!(find_tag(&blob), Some(id.tag()));
        assert_eq!(find_tag(b"no tag here"), None);
        assert_eq!(find_tag(TAG_BEGIN.as_bytes()), None);
    }

    #[test]
    fn test_find_tag_skips_bare_sentinels() {
        let id = BuildIdentity::new("abc", "main", "now");
        let mut blob = Vec::new();
        blob.extend_from_slice(TAG_BEGIN.as_bytes());
        blob.extend_from_slice(b"\0\0Rev:\0");
        blob.extend_from_slice(TAG_END.as_bytes());
        blob.extend_from_slice(b"\0padding\0");
        blob.extend_from_slice(TAG_BEGIN.as_bytes());
        blob.extend_from_slice(id.tag().as_bytes());
        assert_eq!(find_tag(&blob), Some(id.tag()));
    }

    #[test]
    fn test_install_is_write_once() {
        let first = BuildIdentity::install(BuildIdentity::new("first", "main", "t0")).unwrap();
        assert_eq!(first.revision(), "first");
        assert_eq!(published_tag(), Some(first.tag()));

        let err = BuildIdentity::install(BuildIdentity::new("second", "main", "t1")).unwrap_err();
        assert!(matches!(err, IdentityError::AlreadyInstalled { ref revision } if revision == "first"));
        assert_eq!(BuildIdentity::current().map(|id| id.revision()), Some("first"));
    }
}
