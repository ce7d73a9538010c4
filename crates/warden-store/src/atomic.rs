//! Atomic JSON file persistence: write to a temp file in the same
//! directory, fsync, then rename over the target. Avoids truncated or
//! torn writes if the process is killed mid-save.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize state for {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to parse state at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Write `value` as pretty JSON to `path`, atomically.
///
/// Failure here is always reported to the caller; whether the caller treats
/// it as best-effort (as the message queue does) is a policy decision made
/// one layer up.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| StoreError::Write {
        path: path.display().to_string(),
        source,
    })?;

    let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.display().to_string(),
        source,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| StoreError::Write {
        path: path.display().to_string(),
        source,
    })?;
    tmp.write_all(&json).map_err(|source| StoreError::Write {
        path: path.display().to_string(),
        source,
    })?;
    tmp.as_file().sync_all().map_err(|source| StoreError::Write {
        path: path.display().to_string(),
        source,
    })?;
    tmp.persist(path).map_err(|e| StoreError::Write {
        path: path.display().to_string(),
        source: e.error,
    })?;

    Ok(())
}

/// Read and parse a JSON file, returning `Ok(None)` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let value = serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        n: u32,
        s: String,
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/state.json");
        let value = Sample {
            n: 7,
            s: "hello".to_string(),
        };

        write_json_atomic(&path, &value).unwrap();
        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn read_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let loaded: Option<Sample> = read_json(&path).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn write_twice_leaves_only_final_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_json_atomic(&path, &Sample { n: 1, s: "a".into() }).unwrap();
        write_json_atomic(&path, &Sample { n: 2, s: "b".into() }).unwrap();

        let loaded: Sample = read_json(&path).unwrap().unwrap();
        assert_eq!(loaded, Sample { n: 2, s: "b".into() });

        // no leftover temp files in the directory
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
