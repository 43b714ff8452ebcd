//! Evotrade Dashboard Service
//!
//! Backend for a trading dashboard over an evolutionary agent population:
//! gated order execution (paper and live), market data caching, arm/disarm
//! safety controls and real-time updates over SSE.

pub mod alerts;
pub mod arming;
pub mod config;
pub mod dashboard;
pub mod exchange;
pub mod execution;
pub mod gates;
pub mod marketdata;
pub mod paper_trading;
pub mod persistence;
pub mod population;
pub mod types;
