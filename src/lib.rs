pub mod autosub;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod doc_id;
pub mod error;
pub mod fence;
pub mod fetcher;
pub mod ids;
pub mod invocation;
pub mod matcher;
pub mod multiplex;
pub mod oplog;
pub mod protocol;
pub mod source;
pub mod store;
pub mod stream;
