pub mod config;
pub mod presence;
pub mod relay;
pub mod repository;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod services;

#[cfg(test)]
mod test_support;

pub use config::SignalingServerConfig;
pub use server::run_server;
