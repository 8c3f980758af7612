//! Filesystem-safe name components
//!
//! Build identity strings (branch names in particular) routinely contain
//! characters that cannot appear in a file name, e.g. `feature/my-fix`.

/// Character substituted for every forbidden character
pub const PLACEHOLDER: char = '_';

/// Returns true if `c` cannot appear in a portable file name component
pub fn is_forbidden(c: char) -> bool {
    matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

/// Turn an arbitrary string into a filesystem-safe token.
///
/// Every forbidden character becomes [`PLACEHOLDER`] and at most
/// `max_len - 1` characters are kept, so the result always fits a buffer of
/// `max_len` slots with room for a terminator. Truncation counts characters,
/// never splitting a code point.
///
/// ```
/// use crashlab_core::sanitize::sanitize;
///
/// assert_eq!(sanitize("feature/my-fix", 64), "feature_my-fix");
/// assert_eq!(sanitize("a:b", 2), "a");
/// ```
pub fn sanitize(raw: &str, max_len: usize) -> String {
    let limit = max_len.saturating_sub(1);
    raw.chars()
        .take(limit)
        .map(|c| if is_forbidden(c) { PLACEHOLDER } else { c })
        .collect()
}
