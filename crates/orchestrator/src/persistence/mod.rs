pub mod client;
pub mod command_repository;
pub mod errors;
pub mod history_repository;
pub mod host_repository;
pub mod schedule_repository;
pub mod schema;
pub mod webhook_repository;

pub use client::DbClient;
pub use command_repository::CommandRepository;
pub use errors::DbError;
pub use history_repository::HistoryRepository;
pub use host_repository::HostRepository;
pub use schedule_repository::ScheduleRepository;
pub use webhook_repository::WebhookRepository;
