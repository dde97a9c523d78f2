use crate::TransferError;

/// Validates a destination path inside the object store.
///
/// Store paths are `/`-separated and relative to the tree root. Rejects:
/// - Empty paths
/// - Absolute paths (`/x`) and Windows drive or UNC prefixes
/// - Parent (`..`), current (`.`) and empty segments (`a//b`, trailing `/`)
/// - Backslashes and control characters
pub fn validate_object_path(path: &str) -> Result<(), TransferError> {
    if path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    if path.starts_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {path}"
        )));
    }

    if path.contains('\\') {
        return Err(TransferError::InvalidPath(format!(
            "backslash not allowed: {path}"
        )));
    }

    if path.chars().any(char::is_control) {
        return Err(TransferError::InvalidPath(format!(
            "control character in path: {path:?}"
        )));
    }

    let first = path.split('/').next().unwrap_or_default();
    if first.len() == 2 && first.ends_with(':') {
        return Err(TransferError::InvalidPath(format!(
            "drive prefix not allowed: {path}"
        )));
    }

    for segment in path.split('/') {
        match segment {
            "" => {
                return Err(TransferError::InvalidPath(format!(
                    "empty segment in path: {path}"
                )));
            }
            "." | ".." => {
                return Err(TransferError::InvalidPath(format!(
                    "relative segment not allowed: {path}"
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_object_path("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_object_path("../../../etc/passwd").is_err());
        assert!(validate_object_path("images/../../escape").is_err());
        assert!(validate_object_path("..").is_err());
    }

    #[test]
    fn rejects_absolute_path() {
        assert!(validate_object_path("/tmp/malicious").is_err());
    }

    #[test]
    fn rejects_windows_forms() {
        assert!(validate_object_path("C:\\Windows\\evil").is_err());
        assert!(validate_object_path("C:/Windows/evil").is_err());
        assert!(validate_object_path("\\\\server\\share").is_err());
    }

    #[test]
    fn rejects_empty_and_dot_segments() {
        assert!(validate_object_path("images//a.png").is_err());
        assert!(validate_object_path("images/").is_err());
        assert!(validate_object_path("./a.png").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_object_path("files/a\nb").is_err());
    }

    #[test]
    fn accepts_store_paths() {
        assert!(validate_object_path("a.bin").is_ok());
        assert!(validate_object_path("videos/1700000000000-abc123-movie.mp4").is_ok());
        assert!(validate_object_path("code/.env.part000").is_ok());
        assert!(validate_object_path("docs/报告.pdf").is_ok());
    }
}
