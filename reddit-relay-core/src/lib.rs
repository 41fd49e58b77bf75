#![doc = "reddit-relay-core: moderated Reddit-to-channel media relay."]

//! Polls subreddit feeds per rule, filters out anything already seen, asks the rule's
//! admin to approve each new media post, prepares approved media into a delivery-ready
//! asset and hands it to the destination channel.
//!
//! The network-facing pieces (Reddit, the chat platform) are traits in [`contract`];
//! the binary crate provides real implementations and tests provide mocks.
//!
//! # Usage
//! Build a [`relay::Relay`] from a [`config::RelayConfig`], a set of stores and the
//! collaborators, then `start` it.

pub mod approval;
pub mod config;
pub mod contract;
pub mod cycle;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod model;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod store;
