//! Meridian Intent - declarative connectivity and its compilation
//!
//! An application states the connectivity it wants as an [`Intent`]. A
//! compiler validates the intent against the current topology and produces a
//! [`FlowObjectiveIntent`]: one forwarding objective per device input port,
//! ready for mastership-gated installation.
//!
//! Compilation is a pure function of the intent and the topology view, so
//! recompiling after a topology change can be diffed against the previous
//! result with [`FlowObjectiveIntent::diff`].

#![forbid(unsafe_code)]

/// Compilers and compiled results
pub mod compiler;

/// Intent errors
pub mod errors;

/// Intent model
pub mod intent;

pub use compiler::{
    FlowObjectiveIntent, Installable, IntentCompiler, LinkCollectionCompiler, INTENT_FRAMEWORK_APP,
};
pub use errors::{CompilationError, Result};
pub use intent::{
    Intent, IntentKey, LinkCollectionIntent, LinkCollectionIntentBuilder, DEFAULT_INTENT_PRIORITY,
};
