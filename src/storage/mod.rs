//! On-disk staging tree and the archive built from it

pub mod archive;
pub mod paths;
