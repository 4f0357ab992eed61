//! Concrete repository implementations.

pub mod download_job;

pub use download_job::PgDownloadJobRepository;
