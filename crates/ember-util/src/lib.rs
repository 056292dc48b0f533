//! ember-util - Shared infrastructure for the Ember scripting engine.
//!
//! The engine's front end reports problems through the [`Handler`] sink in
//! [`diagnostic`]; the crate deliberately stays small so that every other
//! workspace member can depend on it without pulling in the runtime.

pub mod diagnostic;

pub use diagnostic::{Diagnostic, ErrorLocation, Handler, Level};
