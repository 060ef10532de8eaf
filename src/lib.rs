//! Job orchestration engine for WhatsApp message dispatch and number
//! verification.
//!
//! Local sends run step by step in this process; verifications run on the
//! provider and are mirrored by polling. Both live in one shared ledger that
//! any number of processes can observe and steer.

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod history;
pub mod job;
pub mod ledger;
pub mod notify;
pub mod poller;
pub mod provider;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod toast;
pub mod ui;

#[cfg(test)]
mod testing;
