pub mod http;
pub mod tcp_sync;
pub mod udp;
