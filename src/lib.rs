//! Offline-first sync core for a quick fuel-logging client backed by
//! LubeLogger.
//!
//! Records are delivered immediately when possible and otherwise queued in a
//! local SQLite store, then drained on a timer and whenever connectivity
//! returns. A request interceptor serves cached reads while offline and
//! replays captured writes on background-sync signals.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod interceptor;
pub mod lubelogger;
pub mod model;
pub mod service;
pub mod sync;
