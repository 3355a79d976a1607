pub mod command_router;
pub mod mac_vendor;
pub mod pruner;
pub mod schedule_worker;
pub mod webhook_dispatcher;

pub use command_router::CommandRouter;
pub use mac_vendor::MacVendorCache;
pub use schedule_worker::ScheduleWorker;
pub use webhook_dispatcher::WebhookDispatcher;
