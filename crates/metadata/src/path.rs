//! TOC entry name normalization.

use crate::error::{ErrorKind, Result};

/// Split a TOC entry name into normalized path components.
///
/// Names are always `/`-separated regardless of platform. Leading slashes,
/// `.` and empty components are dropped; `..` pops the previous component
/// but may never climb above the archive root. An empty result names the
/// root itself (e.g. `"./"`).
///
/// Null bytes are rejected outright.
pub(crate) fn components(name: &str) -> Result<Vec<&str>> {
    if name.contains('\0') {
        exn::bail!(ErrorKind::InvalidName(name.to_string()));
    }
    let mut components = Vec::new();
    for component in name.split('/') {
        match component {
            "" | "." => {},
            ".." => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidName(name.to_string()));
                }
            },
            normal => components.push(normal),
        }
    }
    Ok(components)
}
