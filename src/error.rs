use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("bson: {0}")]
    Bson(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported by matcher: {0}")]
    Matcher(String),

    #[error("postgres: {0}")]
    Postgres(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("{0}")]
    Msg(String),
}

impl From<bson::ser::Error> for Error {
    fn from(e: bson::ser::Error) -> Self {
        Error::Bson(e.to_string())
    }
}

impl From<bson::de::Error> for Error {
    fn from(e: bson::de::Error) -> Self {
        Error::Bson(e.to_string())
    }
}

pub type Result<T> = StdResult<T, Error>;
