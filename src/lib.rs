pub mod config;
pub mod events;
pub mod ipc;
pub mod scheduler;
pub mod supervisor;
pub mod utils;
