//! # pushline-core
//!
//! Domain types and pure logic shared by all Pushline crates: topics,
//! messages, subscribers, accounts, plan limits, priorities, and the
//! handful of pure functions (name sanitization, priority mapping, quota
//! reset computation) the pipeline depends on.

pub mod id;
pub mod plan;
pub mod time_util;
pub mod types;

pub use id::{generate_api_key, generate_id};
pub use plan::{Plan, PlanLimits, PlanTable};
pub use time_util::next_month_start;
pub use types::{
    Account, ChannelType, DeliveryAttempt, DeliveryStatus, Message, NewDeliveryAttempt,
    NewMessage, NewSubscriber, Priority, Subscriber, Topic, sanitize_topic_name,
};
