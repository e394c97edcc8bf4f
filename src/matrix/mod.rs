pub mod appservice;
pub mod client;

pub use appservice::{AppserviceState, MatrixEvent};
pub use client::MatrixClient;
