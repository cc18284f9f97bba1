pub mod api;
pub mod core;
pub mod server;
pub mod tools;
pub mod utils;
