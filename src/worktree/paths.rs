use std::path::{Path, PathBuf};

/// Canonical form of `path`, following symlinks. When the path does not exist
/// yet, the nearest existing ancestor is resolved and the rest re-attached.
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return resolved;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => return path.to_path_buf(),
        }
    };

    let mut missing = Vec::new();
    let mut cursor = absolute.as_path();
    loop {
        if let Ok(resolved) = std::fs::canonicalize(cursor) {
            return missing
                .iter()
                .rev()
                .fold(resolved, |acc: PathBuf, part| acc.join(part));
        }
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                cursor = parent;
            }
            _ => return absolute,
        }
    }
}

/// True when `path` lies at or below `root`, compared component-wise.
pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_path_is_canonicalized() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a");
        std::fs::create_dir(&nested).unwrap();
        let dotted = temp_dir.path().join("a").join("..").join("a");

        assert_eq!(canonicalize_lenient(&dotted), std::fs::canonicalize(&nested).unwrap());
    }

    #[test]
    fn test_missing_path_resolves_through_ancestor() {
        let temp_dir = TempDir::new().unwrap();
        let root = std::fs::canonicalize(temp_dir.path()).unwrap();
        let missing = temp_dir.path().join("not").join("yet");

        assert_eq!(canonicalize_lenient(&missing), root.join("not").join("yet"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_root_resolves_to_target() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("real");
        std::fs::create_dir(&target).unwrap();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let resolved = canonicalize_lenient(&link.join("drone-1"));
        assert_eq!(resolved, std::fs::canonicalize(&target).unwrap().join("drone-1"));
        assert!(is_within(&resolved, &std::fs::canonicalize(&target).unwrap()));
    }

    #[test]
    fn test_is_within_is_component_wise() {
        assert!(is_within(Path::new("/tmp/hive/drone-1"), Path::new("/tmp/hive")));
        assert!(!is_within(Path::new("/tmp/hive-other/drone-1"), Path::new("/tmp/hive")));
    }
}
