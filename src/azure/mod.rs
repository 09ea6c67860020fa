//! Azure resource management through the Azure CLI

pub mod cli;
pub mod loadbalancer;
pub mod storage;
pub mod tags;

pub use cli::{detect_az, AzCli, AzStatus};
