//! Alarm notification dispatch engine.
//!
//! Alarms enter through [`dispatcher::AlarmDispatcher`], are filtered by the
//! [`classifier`] and [`fuse`] controller, queued by the [`queue`] protocol and
//! delivered by the [`worker`] pool, with failed sends retried via [`retry`].

pub mod classifier;
pub mod dispatcher;
pub mod fuse;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod rules;
pub mod singleflight;
pub mod store;
pub mod worker;
