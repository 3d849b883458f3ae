//! Autoshop API Library
//!
//! Back-office core for an automotive repair shop: the work-order state
//! machine, the parts inventory engine, sales with payments and cash shifts,
//! commissions and accounts payable. HTTP routing and authentication live in
//! front of this crate; callers pass an [`services::Actor`].
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod money;
pub mod services;

pub use errors::ServiceError;
pub use services::{factory::AppServices, Actor};
