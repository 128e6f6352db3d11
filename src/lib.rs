pub mod archive;
pub mod cancel;
pub mod client;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod manifest;
pub mod normalize;
pub mod output;
pub mod pager;
pub mod query;
pub mod results;
