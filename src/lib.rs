pub mod commands;
pub mod config;
pub mod http;
pub mod proxy;
pub mod service;

#[cfg(test)]
pub mod test_utils;
