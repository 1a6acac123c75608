//! # Docdex
//!
//! A local-first document indexing pipeline with semantic search.
//!
//! Docdex ingests files into per-project collections, splits them into
//! overlapping chunks, generates embeddings through a local embedding
//! service, and maintains one approximate nearest neighbor index per project
//! for semantic retrieval. A filesystem watcher can keep a project in sync
//! with a directory automatically.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────────┐   ┌──────────┐
//! │  Files /  │──▶│   Pipeline    │──▶│  SQLite  │
//! │  Watcher  │   │ Parse+Chunk+  │   │ chunks + │
//! └───────────┘   │    Embed      │   │ vectors  │
//!                 └───────────────┘   └────┬─────┘
//!                                          │
//!                                          ▼
//!                                   ┌─────────────┐
//!                                   │ HNSW index  │
//!                                   │ per project │
//!                                   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docdex init                           # create database
//! docdex project add --name docs        # create a project
//! docdex ingest <project> ./docs        # parse and chunk files
//! docdex embed project <project>        # generate embeddings
//! docdex search <project> "deployment"  # semantic search
//! docdex watch <project>                # auto-ingest on file changes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`store`] | Relational persistence |
//! | [`parser`] | File type detection and text extraction |
//! | [`chunk`] | Text and code chunking |
//! | [`embedding`] | Embedding service client |
//! | [`vector_index`] | Per-project ANN indexes |
//! | [`progress`] | Embedding job progress tracking |
//! | [`ingest`] | Document ingestion |
//! | [`embed_jobs`] | Batched embedding orchestration |
//! | [`watcher`] | Filesystem watching |
//! | [`service`] | Service wiring and pipeline operations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_jobs;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod progress;
pub mod service;
pub mod store;
pub mod vector_index;
pub mod watcher;
