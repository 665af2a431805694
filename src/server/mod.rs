mod batch;
pub mod dto;
mod objects;
mod router;

pub use router::AppState;
pub use router::create_router;
