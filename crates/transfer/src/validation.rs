use std::path::{Component, Path};

use crate::TransferError;

/// Checks that a tar entry path stays inside the extraction directory.
///
/// Rejects empty paths, absolute paths, `..` components and platform
/// prefixes such as `C:` or `\\server`.
pub fn validate_entry_path(entry: &Path) -> Result<(), TransferError> {
    let shown = entry.display();
    if entry.as_os_str().is_empty() {
        return Err(TransferError::InvalidPath("empty entry path".into()));
    }
    if entry.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute entry path: {shown}"
        )));
    }

    for component in entry.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "entry escapes target directory: {shown}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute entry path: {shown}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}
