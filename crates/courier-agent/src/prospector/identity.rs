//! File identity: what makes a file "the same file" across renames.

use std::fmt;
use std::fs::Metadata;

/// OS-level identity of a file, stable across renames.
///
/// Two paths with equal identity refer to the same underlying file. On unix
/// this is the (device, inode) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    #[must_use]
    pub fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: meta.dev(),
            inode: meta.ino(),
        }
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_survives_rename() {
        let dir = tempfile::tempdir().unwrap();
        let before = dir.path().join("a.log");
        std::fs::write(&before, b"data").unwrap();
        let id_before = FileIdentity::of(&std::fs::metadata(&before).unwrap());

        let after = dir.path().join("b.log");
        std::fs::rename(&before, &after).unwrap();
        let id_after = FileIdentity::of(&std::fs::metadata(&after).unwrap());

        assert_eq!(id_before, id_after);
    }

    #[test]
    fn test_distinct_files_differ() {
        let dir = tempfile::tempdir().unwrap();
        let one = dir.path().join("one.log");
        let two = dir.path().join("two.log");
        std::fs::write(&one, b"1").unwrap();
        std::fs::write(&two, b"2").unwrap();

        let id_one = FileIdentity::of(&std::fs::metadata(&one).unwrap());
        let id_two = FileIdentity::of(&std::fs::metadata(&two).unwrap());
        assert_ne!(id_one, id_two);
    }
}
