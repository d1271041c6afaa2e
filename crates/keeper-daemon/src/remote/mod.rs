mod classify;
mod rclone;

pub use rclone::{RcloneRemote, RcloneSettings};
