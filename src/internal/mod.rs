pub mod agent;
pub mod arbiter;
pub mod channel;
pub mod config;
pub mod data_types;
pub mod envelope;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod webrtc_transport;
