pub mod builder;
pub mod config;
pub mod credentials;
pub mod dataset;
pub mod errors;
pub mod naming;
pub mod paths;
pub mod rees;
pub mod registry;
pub mod retry;
pub mod source;
pub mod source_host;
pub mod spawner;
pub mod ui;

#[cfg(test)]
mod test_support;
