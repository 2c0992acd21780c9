#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod connection;
pub mod health;
pub mod history;
pub mod response_buffer;
pub mod session;
pub mod state;

#[cfg(test)]
mod connection_tests;
