pub mod stream;
pub mod protocol;
pub mod connection;
pub mod join_tokens;
pub mod ipc;
pub mod worker;
pub mod process_manager;
pub mod framing;
pub mod transport;
