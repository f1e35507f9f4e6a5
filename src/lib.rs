pub mod attachments;
pub mod blob;
pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handoff;
pub mod ingest;
pub mod oauth;
pub mod output;
pub mod status;
pub mod sync;
pub mod tokens;
pub mod watermark;
