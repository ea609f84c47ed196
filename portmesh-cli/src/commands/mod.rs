pub mod agent;
pub mod notify;
pub mod server;
pub mod version;
