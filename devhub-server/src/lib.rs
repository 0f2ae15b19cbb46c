pub mod config;
pub mod server;
pub mod state;

pub use config::AppConfig;
pub use server::router;
pub use state::AppContext;
