pub mod core;
pub mod yaml;
