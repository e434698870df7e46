pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod service;
pub mod signals;
pub mod supervisor;

#[cfg(test)]
mod test_utils;
