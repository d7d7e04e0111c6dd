//! Tuner-side policy: what may run and what gets clicked.
//!
//! This module provides:
//! - [`AdmissionController`]: FIFO-fair bound on concurrent sessions
//! - [`ChannelSelector`]: finds and clicks a channel tile on a grid page
//! - [`lineup`]: built-in and configured channel lineups

pub mod admission;
pub mod lineup;
pub mod selector;

pub use admission::{AdmissionController, AdmissionSlot};
pub use selector::{ChannelSelector, SelectError, SelectorConfig};
