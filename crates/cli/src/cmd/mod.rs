//! CLI command implementations

pub mod cdimg;
pub mod compare;
pub mod diff;
pub mod merge;
pub mod pack;
pub mod patch;
pub mod show;
