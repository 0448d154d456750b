pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod providers;
pub mod services;

#[cfg(test)]
mod test_support;
