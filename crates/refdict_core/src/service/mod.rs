//! Use-case entry points for outer layers (HTTP, CLI).
//!
//! # Responsibility
//! - Keep request/response shaping out of persistence and sync code.

pub mod dictionary_service;
