//! Taro Common - shared error taxonomy and utilities
//!
//! This crate provides:
//! - `TaroError`: typed error signals for the coordinator protocol
//! - `ErrorCode`: structured error codes for protocol responses
//! - Timestamp and ticket id helpers

pub mod error;
pub mod utils;

pub use error::{ErrorCode, TaroError};
pub use utils::{current_timestamp, new_ticket_id};
