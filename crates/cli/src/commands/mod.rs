pub mod chat;
pub mod config_cmd;
pub mod detect;
pub mod memory;
pub mod runtime;
pub mod tasks;
