// Plugin infrastructure for nexus-play

pub mod callbacks;

pub use callbacks::{CallbackManager, CallbackPlugin, JsonLogCallback, TracingCallback};
