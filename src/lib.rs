//! # Catalog Sync
//!
//! Keeps a local SQLite replica of a container image catalog in step with
//! the authoritative catalog service: repositories, the images they
//! publish, the CVEs affecting each image, and the associations between
//! them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Catalog    │──▶│  Reconciler  │──▶│  SQLite  │
//! │  HTTP API   │   │ cache+buffer │   │ replica  │
//! └─────────────┘   └──────────────┘   └──────────┘
//! ```
//!
//! Each run loads the replica into memory once, then diffs every in-scope
//! repository against the catalog inside its own transaction.
//!
//! ## Quick Start
//!
//! ```bash
//! catalog-sync init                 # create database
//! catalog-sync sync                 # reconcile every repository
//! catalog-sync sync --profile ubi   # reconcile an allow-listed subset
//! catalog-sync stats                # row counts
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`catalog`] | Catalog trait and HTTP adapter |
//! | [`cache`] | Replica cache and pending buffer |
//! | [`store`] | SQL statements |
//! | [`sync`] | Reconciliation engine |
//! | [`profile`] | Repository allow-lists |
//! | [`stats`] | Replica statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Error types |

pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod profile;
pub mod stats;
pub mod store;
pub mod sync;
