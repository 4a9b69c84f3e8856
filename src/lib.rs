#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod formats;
pub mod logging;
pub mod normalize;
pub mod openai;
pub mod reduce;
pub mod results;
pub mod run;
