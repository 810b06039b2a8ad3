pub mod config;
pub mod core;
pub mod crypto;
pub mod miner;
pub mod network;
pub mod node;
pub mod sim;
pub mod storage;
pub mod wallet;
