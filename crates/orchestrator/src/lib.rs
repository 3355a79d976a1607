pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod kernel;
pub mod persistence;
pub mod routes;
pub mod services;
pub mod state;

pub use config::Config;
pub use errors::RouteError;
pub use services::CommandRouter;
pub use state::AppState;
