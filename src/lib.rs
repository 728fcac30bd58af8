pub mod cli;
pub mod conntrack;
pub mod error;
pub mod loglimit;
pub mod model;
pub mod output;
pub mod source;

pub use conntrack::{Config, Conntracker};
