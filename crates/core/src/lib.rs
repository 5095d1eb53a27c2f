//! Ticket Desk Core - Shared types library.
//!
//! This crate provides the types shared by every Ticket Desk component:
//! - `engine` - Sessions, authorization, the ticket store and live subscriptions
//! - `cli` - Operator tooling for provisioning and scripted runs
//!
//! # Architecture
//!
//! The core crate contains only types and validation - no I/O, no locking,
//! no async runtime. This keeps it lightweight and allows it to be used anywhere.
//!
//! # Modules
//!
//! - [`types`] - Newtype wrappers for ids, emails and phones, status enums,
//!   and the ticket wire record

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
