pub mod client;

pub use client::HttpSessionBackend;
