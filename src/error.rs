use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("data list not found: {}", .0.display())]
    DataListNotFound(PathBuf),

    #[error("{}:{line}: expected `path,x,y,w,h,a`, got {fields} field(s)", .path.display())]
    MalformedRow {
        path: PathBuf,
        line: usize,
        fields: usize,
    },

    #[error("invalid label value {value:?} for {image}")]
    InvalidLabel { image: String, value: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error for {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("recorder error: {0}")]
    Recorder(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Tensor(String),
}

impl From<burn::record::RecorderError> for Error {
    fn from(err: burn::record::RecorderError) -> Self {
        Error::Recorder(err.to_string())
    }
}

impl From<burn::config::ConfigError> for Error {
    fn from(err: burn::config::ConfigError) -> Self {
        Error::Config(format!("{err:?}"))
    }
}
