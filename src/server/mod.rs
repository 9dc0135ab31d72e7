// src/server/mod.rs
mod proxy_server;

pub use proxy_server::{ProxyServer, IDLE_TIMEOUT, READ_TIMEOUT, WRITE_TIMEOUT};
