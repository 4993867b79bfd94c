/// Utilities for dealing with the file system.

use std::fs;
use std::io::Write;
use std::path::Path;
use log::error;
use crate::error::Failed;


//------------ create_dir_all ------------------------------------------------

/// Creates all directories leading to the given directory or logs an error.
pub fn create_dir_all(path: &Path) -> Result<(), Failed> {
    fs::create_dir_all(path).map_err(|err| {
        error!(
            "Fatal: failed to create directory {}: {}",
            path.display(), err
        );
        Failed
    })
}


//------------ read_to_string ------------------------------------------------

/// Reads a file into a string, logging an error on failure.
pub fn read_to_string(path: &Path) -> Result<String, Failed> {
    fs::read_to_string(path).map_err(|err| {
        error!(
            "Fatal: failed to read file {}: {}",
            path.display(), err
        );
        Failed
    })
}


//------------ write_file ----------------------------------------------------

/// Writes data to a file, creating parent directories as necessary.
pub fn write_file(path: &Path, data: &[u8]) -> Result<(), Failed> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    fs::write(path, data).map_err(|err| {
        error!(
            "Fatal: failed to write file {}: {}",
            path.display(), err
        );
        Failed
    })
}


//------------ replace_file --------------------------------------------------

/// Atomically replaces the file at `path` with the given content.
///
/// Writes to a temporary file in the same directory and renames it into
/// place so that readers never observe a partially written file.
pub fn replace_file(path: &Path, data: &[u8]) -> Result<(), Failed> {
    let dir = match path.parent() {
        Some(dir) => dir,
        None => {
            error!(
                "Fatal: cannot replace file {}: no parent directory",
                path.display()
            );
            return Err(Failed)
        }
    };
    create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|err| {
        error!(
            "Fatal: failed to create temporary file in {}: {}",
            dir.display(), err
        );
        Failed
    })?;
    tmp.write_all(data).map_err(|err| {
        error!(
            "Fatal: failed to write temporary file {}: {}",
            tmp.path().display(), err
        );
        Failed
    })?;
    tmp.persist(path).map(|_| ()).map_err(|err| {
        error!(
            "Fatal: failed to move temporary file into place at {}: {}",
            path.display(), err
        );
        Failed
    })
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_file_is_atomic_for_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.txt");
        replace_file(&path, b"first").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        replace_file(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("c.txt");
        write_file(&path, b"x").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x");
    }
}
