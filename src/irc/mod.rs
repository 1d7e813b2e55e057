pub mod bridge;
pub mod client;
pub mod codec;
pub mod event;
pub mod room;
pub mod server;
