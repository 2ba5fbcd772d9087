// Error taxonomy and HTTP mapping
pub mod error;

// File + environment configuration
pub mod config;

// Bearer tokens and secret helpers
pub mod auth;

// Brokerage credential storage
pub mod credentials;

// Brokerage-side OAuth client
pub mod broker;

// MCP-facing OAuth 2.1 authorization server
pub mod oauth;

// Human approval of mutating actions
pub mod approval;

// Action catalog and execution pipeline
pub mod gate;

// Per-client rate limiting
pub mod rate_limit;

// HTTP routers
pub mod api;
