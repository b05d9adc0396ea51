#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod raft;
pub mod service;
pub mod storage;

pub use client::{Client, Strategy};
pub use error::{Error, Result};
pub use raft::Server;
