// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod mandatory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod rpc;
pub mod transport;
