pub mod command;
pub mod events;
pub mod fqn;
pub mod host;
pub mod mac;
pub mod node;
pub mod schedule;
pub mod webhook;

pub use command::{Command, CommandState, CommandType};
pub use events::{AggregatorEvent, StreamEvent, WakeVerificationComplete, WakeVerificationStatus};
pub use fqn::{Fqn, FqnError};
pub use host::{Host, HostStats, HostStatus, OpenPort, PortScanSnapshot, PowerControlMetadata, UptimeSummary};
pub use node::{Node, NodeStatus};
pub use schedule::{ScheduleExecutionAttempt, ScheduleFrequency, WakeSchedule};
pub use webhook::{DeliveryStatus, Webhook, WebhookDelivery};
