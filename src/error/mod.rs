pub mod drive_error;

pub use drive_error::{DriveError, Result};
