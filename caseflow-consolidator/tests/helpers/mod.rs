//! Test Helper Utilities
//!
//! Shared utilities for testing caseflow-consolidator

#![allow(dead_code)]

pub mod builders;
pub mod db_utils;

pub use builders::{dec, invoice, order_line, projected, ts, RecordBuilder};
pub use db_utils::{
    classify, corrupt_column, memory_state, memory_state_with, record_by_id, refuse_inserts, refuse_updates,
};
