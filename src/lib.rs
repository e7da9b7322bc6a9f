pub mod cli;
pub mod config;
pub mod enrich;
pub mod links;
pub mod search;
pub mod storage;
pub mod store;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use store::{LinkMetadata, Post, PostId, PostStore, StoreError};
