pub mod client;
pub mod oauth;

pub use client::{GitterClient, GitterRoom, WhoAmI};
pub use oauth::OauthState;
