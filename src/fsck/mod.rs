pub mod cache;
pub mod config;
pub mod dirtree;
pub mod error;
pub mod fsck;
pub mod fsck_backend;
pub mod fsck_types;
pub mod mock;
pub mod prompt;

mod dirscan;
mod inodes;
mod lostfound;
mod pass1;
mod pass1b;
mod pass2;
mod pass3;
mod pass4;
mod pass5;
mod setup;

pub use dirscan::ScanFix;
pub use fsck::{run_fsck, Fsck};
pub use lostfound::lftempname;
