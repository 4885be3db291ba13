pub mod console;
pub mod state;

pub use state::AppState;
