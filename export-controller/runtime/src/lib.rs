//! Process bootstrap and control loops for the telemetry export controller.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod args;
pub mod artifacts;
pub mod compiler;
pub mod multicluster;
pub mod provider;
pub mod reconciler;
pub mod secrets;

pub use self::args::Args;
