pub mod token;
pub mod webhook;

pub use token::{ServiceClaims, TokenError, TokenService};
pub use webhook::{derive_callback_secret, sign_webhook, verify_webhook_signature, SignatureError};
