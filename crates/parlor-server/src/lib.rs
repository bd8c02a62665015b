pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod server;
pub mod shutdown;

pub use client::ConnectionRegistry;
pub use config::ServerConfig;
pub use coordinator::{AdvanceSchedule, RoomCoordinator};
pub use error::ServerError;
pub use server::{build_router, start, ServerHandle};
pub use shutdown::ShutdownCoordinator;
