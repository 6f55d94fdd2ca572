pub mod controller;
pub mod http;
pub mod server;
