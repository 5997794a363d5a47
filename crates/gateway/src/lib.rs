pub mod config;
pub mod credentials;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod notifier;

#[cfg(test)]
mod testing;
