//! # Stevedore
//!
//! A Git LFS server, usable both as a standalone binary and as a library.
//!
//! Speaks the Git LFS Batch API and brokers large object transfers between
//! git clients and pluggable storage backends (local filesystem, S3, Azure
//! Blobs, Google Cloud Storage), enforcing authentication and authorization
//! on every transfer.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use stevedore::config::{Config, build_state};
//! use stevedore::server::create_router;
//!
//! let config = Config::default();
//! let state = build_state(&config).await?;
//! let router = create_router(state);
//! // Serve with axum...
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;
pub mod transfer;
pub mod util;
