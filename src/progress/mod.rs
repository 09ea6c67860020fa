//! Progress reporting for batch runs

mod reporter;

pub use reporter::*;
