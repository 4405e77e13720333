use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use snafu::ResultExt;

use super::error::{
    CreateDirSnafu, EncodeJsonSnafu, MoveIntoPlaceSnafu, StorageResult, WriteFileSnafu,
};

/// Sibling path a file is staged at before it replaces `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".tmp");
    staged.into()
}

/// Pretty-prints `value` next to `path` and renames it over the target.
///
/// The staged file is flushed to disk before the rename, so readers (and a restart
/// after a crash) see either the old file or the new one, never a partial write.
/// Parent directories are created on demand.
pub fn write_json_atomic<T>(path: &Path, value: &T) -> StorageResult<()>
where
    T: Serialize + ?Sized,
{
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context(CreateDirSnafu {
            stage: "create-parent-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let bytes = serde_json::to_vec_pretty(value).context(EncodeJsonSnafu {
        stage: "encode-json",
    })?;

    let staged = staging_path(path);
    let mut file = File::create(&staged).context(WriteFileSnafu {
        stage: "write-staged-file",
        path: staged.clone(),
    })?;
    file.write_all(&bytes).context(WriteFileSnafu {
        stage: "write-staged-file",
        path: staged.clone(),
    })?;
    file.sync_all().context(WriteFileSnafu {
        stage: "sync-staged-file",
        path: staged.clone(),
    })?;
    drop(file);

    std::fs::rename(&staged, path).context(MoveIntoPlaceSnafu {
        stage: "move-staged-file",
        from: staged.clone(),
        to: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn creates_parents_and_leaves_no_staging_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("a").join("b").join("value.json");

        write_json_atomic(&path, &serde_json::json!({"k": [1, 2]})).expect("write");

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(written["k"][1], 2);
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn large_value_is_written_in_full() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("value.json");
        let value = vec!["chat message text".to_string(); 20_000];

        write_json_atomic(&path, &value).expect("write");

        let written: Vec<String> =
            serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
        assert_eq!(written, value);
    }

    #[test]
    fn blocked_staging_path_keeps_old_contents() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("value.json");
        write_json_atomic(&path, &1).expect("first write");
        std::fs::create_dir(staging_path(&path)).expect("block staging path");

        let error = write_json_atomic(&path, &2).expect_err("write must fail");
        assert!(error.to_string().contains("write-staged-file"));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "1");
    }
}
