//! Building blocks for [`clap`]-driven configuration of the feed tools

pub mod feed;
pub mod logging;
pub mod tokio;
