// =============================================================================
// Control-Plane API — the supervisor's HTTP face
// =============================================================================

pub mod auth;
pub mod rest;
