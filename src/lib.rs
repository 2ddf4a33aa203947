//! Plan-driven browser extraction: a plan document is walked step by step in a
//! headless browser, routed through a rotating proxy pool, and the extracted
//! rows are recorded in a run ledger and exported.

pub mod browser;
pub mod captcha;
pub mod chrome;
pub mod config;
pub mod dom;
pub mod engine;
pub mod error;
pub mod events;
pub mod export;
pub mod face;
pub mod ledger;
pub mod plan;
pub mod planner;
pub mod pool;
pub mod rows;
pub mod service;
