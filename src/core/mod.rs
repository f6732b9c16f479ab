pub mod commands;
pub mod error;
pub mod helm;
pub mod hub;
pub mod installer;
pub mod message;
pub mod node;
pub mod remote;
pub mod replay;
pub mod repository;
pub mod service;
pub mod ssh;
pub mod tasks;

pub use error::{Error, Result};
