use std::path::{Component, Path};

use crate::TransferError;

const MAX_FILE_ID_LEN: usize = 128;
const MAX_FILE_NAME_LEN: usize = 255;

/// Validates a file identifier.
///
/// File ids name the receiver's per-upload chunk directory, so they are
/// restricted to `[A-Za-z0-9._-]` and may not be `.` or `..`.
pub fn validate_file_id(file_id: &str) -> Result<(), TransferError> {
    if file_id.is_empty() {
        return Err(TransferError::Validation("missing fileId".into()));
    }
    if file_id.len() > MAX_FILE_ID_LEN {
        return Err(TransferError::Validation(format!(
            "fileId longer than {MAX_FILE_ID_LEN} characters"
        )));
    }
    if file_id == "." || file_id == ".." {
        return Err(TransferError::Validation(format!("invalid fileId: {file_id}")));
    }
    if let Some(c) = file_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(TransferError::Validation(format!(
            "invalid character {c:?} in fileId"
        )));
    }
    Ok(())
}

/// Validates that a file name is a single, plain path component.
///
/// Rejects empty names, separators, traversal and absolute or prefixed paths.
pub fn validate_file_name(file_name: &str) -> Result<(), TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::Validation("missing fileName".into()));
    }
    if file_name.len() > MAX_FILE_NAME_LEN {
        return Err(TransferError::Validation(format!(
            "fileName longer than {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if file_name.contains(['/', '\\', '\0']) {
        return Err(TransferError::Validation(format!(
            "fileName must not contain separators: {file_name}"
        )));
    }

    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::Validation(format!(
            "fileName must be a plain file name: {file_name}"
        ))),
    }
}
