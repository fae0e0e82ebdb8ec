pub mod models;
pub mod schema;
pub mod state;

pub use models::*;
pub use state::AppState;
