pub mod callbacks;
pub mod health;

pub use callbacks::{
    analysis_callback_handler, callback_health_handler, callback_metrics_handler,
    document_callback_handler,
};
pub use health::{health_handler, worker_health_handler};
