#![deny(clippy::all)]
pub mod candidates;
pub mod config;
pub mod connection;
pub mod console;
pub mod copy_paste_signaling;
pub mod negotiation;
pub mod peer;
pub mod protocol;
pub mod qr;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod sink;
pub mod socket_signaling;
pub mod test_peer;
pub mod test_signaling;
pub mod transport;
pub mod utils;
pub mod version;
