//! Network communication layer.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::TcpParticipantTransport;
pub use rpc::Message;
pub use server::{ParticipantHandler, ParticipantServer};
