pub mod capabilities;
pub mod config;
pub mod serve;
