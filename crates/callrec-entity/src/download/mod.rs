//! Recording download job entity.

pub mod model;
pub mod status;

pub use model::{CreateDownloadJob, DownloadJob};
pub use status::DownloadStatus;
