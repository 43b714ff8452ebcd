//! Web Dashboard Module
//!
//! JSON API and SSE stream backing the trading dashboard SPA. Built with
//! Axum.
//!
//! # Features
//!
//! - **Real-time Updates**: Server-Sent Events (SSE) for quotes, trades and status
//! - **Positions and Orders**: Live position, order and fill views
//! - **Population Views**: Generations, agents, decision tallies and activity
//! - **Safety Controls**: Pause/stop, paper/live mode, time-boxed arming
//! - **Risk Config**: Runtime-editable limits with clamping and audit rows
//!
//! # Usage
//!
//! ```rust,ignore
//! use evotrade_dash::dashboard::{DashboardServer, DashboardState};
//!
//! let state = DashboardState::new(/* ... */);
//! let server = DashboardServer::new(state);
//! server.run().await?;
//! ```

pub mod handlers;
pub mod server;
pub mod sse;
pub mod state;

pub use server::DashboardServer;
pub use state::DashboardState;
