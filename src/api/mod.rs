mod error;
pub mod models;
mod requests;
mod server;
pub mod services;
pub mod state;
mod uploads;

pub use error::ApiError;
pub use server::{build_node, build_router, run};
