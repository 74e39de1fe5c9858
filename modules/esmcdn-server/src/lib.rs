//! The HTTP front: stateless request routing over the build pipeline.

pub mod cache;
pub mod handlers;
pub mod router;
pub mod state;
pub mod wrapper;

pub use router::build_router;
pub use state::AppState;
