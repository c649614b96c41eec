pub mod cli;
pub mod config;
pub mod deployer;
pub mod initializers;
