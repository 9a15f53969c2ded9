pub mod chain;
pub mod configuration;
pub mod data;
pub mod error;
pub mod messages;
pub mod network;
pub mod shutdown;
pub mod sync;
pub mod types;
pub mod utils;
pub mod witness;

#[cfg(test)]
mod test_utils;
