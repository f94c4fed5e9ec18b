//! Protocol implementations.
//!
//! - `frame`: length-prefixed request/response frames

pub mod frame;
