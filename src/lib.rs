//! Outreach pipeline: claim-driven drafting and sending over a shared queue.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod model;
pub mod notes;
pub mod pipeline;
pub mod render;
