// ABOUTME: Shared configuration surface for Skiff crates
// ABOUTME: Re-exports the environment variable name constants

pub mod constants;
