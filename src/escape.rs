//! Branch-name escaping for the on-disk state tree.
//!
//! Branch names may contain `/` and other characters that are unsafe or
//! ambiguous as tree path segments. Every byte outside `[A-Za-z0-9._-]`,
//! plus any leading `.`, is replaced with `%XX` (uppercase hex) so that
//! `branches/<escaped>` is a single unambiguous segment. The mapping is
//! reversible.

use crate::errors::{Error, Result};

fn is_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-'
}

/// Escape a branch name into a filesystem-safe tree path segment.
pub fn escape_branch_name(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = String::with_capacity(bytes.len());

    // Leading dots are escaped too, so segments never look like dotfiles
    // or the `.`/`..` path entries.
    let mut leading = true;
    for &b in bytes {
        if leading && b != b'.' {
            leading = false;
        }
        if is_safe(b) && !(leading && b == b'.') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{:02X}", b));
        }
    }
    out
}

/// Reverse [`escape_branch_name`].
///
/// Fails with an integrity error on malformed escapes; escaped names only
/// ever come from the state tree, so a bad one means a corrupt tree.
pub fn unescape_branch_name(escaped: &str) -> Result<String> {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::Integrity(format!("truncated escape in branch key '{}'", escaped)))?;
            let hex = std::str::from_utf8(hex)
                .map_err(|_| Error::Integrity(format!("malformed escape in branch key '{}'", escaped)))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::Integrity(format!("malformed escape in branch key '{}'", escaped)))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| Error::Integrity(format!("branch key '{}' is not valid UTF-8", escaped)))
}
