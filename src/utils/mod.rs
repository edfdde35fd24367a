// src/utils/mod.rs

pub mod crypto;
pub mod fs;
pub mod net;
pub mod sanitize;

pub use crypto::CryptoUtils;
pub use fs::atomic_write;
pub use net::{broadcast_addresses, local_ipv4_addresses};
pub use sanitize::{sanitize_device_name, sanitize_log_input};
