#![forbid(unsafe_code)]

pub mod age;
pub mod animate;
pub mod blob;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod entities;
pub mod error;
pub mod export;
pub mod frames;
pub mod logging;
pub mod normalize;
pub mod outline;
pub mod prime;
pub mod render;
pub mod session;
pub mod story;
