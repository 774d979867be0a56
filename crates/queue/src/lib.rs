//! Verification email queue for mailverify.
//!
//! - **Jobs**: the [`DeliveryJob`] wire format
//! - **Backends**: Redis streams with a consumer group, or in memory
//! - **Publisher**: durable enqueue behind the core's delivery trait
//! - **Workers**: manual-ack consumer that sends the emails
//! - **Retry**: optional dead-lettering of jobs that keep failing
//! - **Scheduler**: periodic expired token sweep
//! - **Lifecycle**: signal handling and bounded shutdown

pub mod backend;
pub mod jobs;
pub mod lifecycle;
pub mod memory;
pub mod publisher;
pub mod redis_queue;
pub mod retry;
pub mod scheduler;
pub mod workers;

pub use backend::{Delivery, QueueBackend, SharedQueue};
pub use jobs::*;
pub use lifecycle::{ShutdownOutcome, shutdown_signal, supervise};
pub use memory::MemoryQueue;
pub use publisher::JobPublisher;
pub use redis_queue::RedisQueue;
pub use retry::{DeadLetterEntry, RetryPolicy};
pub use scheduler::{JobExecutor, SchedulerConfig, run_scheduler};
pub use workers::*;
