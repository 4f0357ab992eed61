//! # callrec-database
//!
//! PostgreSQL connection management and the download-job repository for
//! the Callrec acquisition engine.

pub mod connection;
pub mod migration;
pub mod repositories;
pub mod repository;

pub use connection::DatabasePool;
pub use repository::DownloadJobRepository;
