//! Vision-guided shopping agent: observes a live page through numbered
//! overlay markers, asks a vision model for one action at a time, and gates
//! purchase-like actions behind human approval.

pub mod analysis;
pub mod brain;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod decision;
pub mod dom;
pub mod driver;
pub mod error;
pub mod executor;
pub mod face;
pub mod grounding;
pub mod guard;
pub mod hands;
pub mod llm;
pub mod observability;
pub mod registry;
pub mod session;
pub mod types;
