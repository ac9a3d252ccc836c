#![doc = include_str!("../README.md")]

pub mod client;
mod common;
pub mod endpoint;
pub mod envelope;
pub mod transport;
pub mod worker;

pub use common::*;
