// Error taxonomy
pub mod error;

// Encrypted credential records
pub mod credentials;

// OAuth authorization-code flow and token refresh
pub mod oauth;

// Push channel lifecycle
pub mod webhook;

// Notification intake and reconciliation
pub mod sync;

// Application session validation/refresh
pub mod session;

// Bearer token handling
pub mod auth;

// HTTP endpoints
pub mod api;

// Configuration loading
pub mod config;
