//! HTTP API for live leaderboards
//!
//! Read endpoints query the engine; the two score mutations pass straight
//! through to the store, whose change feed then drives the engine.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{build_router, run, AppContext};
