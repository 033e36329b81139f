// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod admission;
pub mod appender;
pub mod channel;
pub mod client;
pub mod configs;
pub mod counters;
pub mod errors;
pub mod exchange;
pub mod layer;
pub mod layout;
pub mod link;
pub mod queue;
pub mod record;
pub mod reporter;
pub mod shutdown;
pub mod task;
pub mod topology;
pub mod worker;

pub use appender::{AppenderState, RabbitMQAppender};
pub use configs::AppenderConfigs;
pub use layer::{init_tracing, AmqpLogLayer};
