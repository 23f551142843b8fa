//! # stormware-gdrive
//!
//! Google Drive connector working with paths instead of file IDs.
//!
//! ```text
//! //Finance/Reports/2024/q1.csv
//!   │       └── folders resolved one component at a time
//!   └── shared drive "Finance" (or `/` for the user's "My Drive")
//! ```

pub mod drive;
pub mod error;
pub mod path;

pub use drive::{Drive, MIME_TYPE_FOLDER};
pub use error::{DriveError, DriveErrorKind, DriveResult};
pub use path::DrivePath;
