pub mod config;
pub mod frame;
pub mod protocol;
pub mod settings;
