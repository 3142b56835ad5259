//! Long-term memory for coding assistants.
//!
//! memento persists observations, session summaries and user prompts in SQLite
//! and serves them back through a retrieval layer that blends full-text and
//! semantic vector search.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 mirrors for keyword search; bounded per-project
//!   and global pools with transactional eviction
//! - **Vectors**: [sqlite-vec](https://github.com/asg017/sqlite-vec) index of granular
//!   per-field documents, stamped with the embedding model version
//! - **Search**: vector + keyword rankings merged via Reciprocal Rank Fusion, near
//!   duplicates collapsed by Jaccard similarity, structured fallback when the
//!   vector index is unavailable
//! - **Transport**: MCP over stdio
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML and environment variables
//! - [`db`]: SQLite initialization, schema and migrations
//! - [`embedding`]: text-to-vector embedding via ONNX Runtime
//! - [`store`]: retention store for sessions, observations, summaries and prompts
//! - [`vector`]: vector index client
//! - [`cluster`]: Jaccard clustering and near-duplicate detection
//! - [`rrf`]: rank fusion
//! - [`search`]: unified search manager
//! - [`engine`]: store + index wiring
//! - [`tools`]: MCP tool surface

pub mod cluster;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod rrf;
pub mod search;
pub mod store;
pub mod tools;
pub mod vector;
