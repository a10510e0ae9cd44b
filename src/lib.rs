pub mod cg;
pub mod dir;
pub mod fs;
pub mod fsck;
pub mod inode;
pub mod mkfs;
