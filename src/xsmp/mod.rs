pub mod authority;
pub mod protocol;
pub mod server;
