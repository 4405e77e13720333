use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("could not create directory {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not read {path:?} on `{stage}`: {source}"))]
    ReadFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not write {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not move {from:?} into place at {to:?} on `{stage}`: {source}"))]
    MoveIntoPlace {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not remove {path:?} on `{stage}`: {source}"))]
    RemoveFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("could not encode JSON on `{stage}`: {source}"))]
    EncodeJson {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("saved chats at {path:?} are unreadable on `{stage}`: {source}"))]
    DecodeChats {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
