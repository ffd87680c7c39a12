pub mod app;
pub mod receiver;
pub mod routes;

pub use app::{build_app, build_state, AppState};
pub use receiver::{CallbackEnvelope, CallbackOutcome, CallbackReceiver, CallbackStatus};
