//! Rendering front-ends for the loam signal-graph engine.
//!
//! This crate provides:
//!
//! - **Configuration**: [`EngineConfig`] loaded from TOML
//! - **Offline rendering**: [`render_offline`] writes an exact number of frames
//!   to a [`BlockSink`] ([`VecSink`] in memory, [`WavSink`] to disk), cancellable
//!   between blocks through a [`CancelToken`]
//! - **Realtime sessions**: [`session`] splits into a [`SessionHandle`] for control
//!   threads and a [`RealtimeRenderer`] for the audio thread, with lock-free plan
//!   handoff and a background latency worker
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use loam_core::{Topology, compile_with, nodes::Constant};
//! use loam_io::{CancelToken, EngineConfig, WavSink, render_offline};
//! use std::time::Duration;
//!
//! let config = EngineConfig::load("engine.toml")?;
//! let mut topology = Topology::new();
//! topology.add_node(Constant::new(0.25, config.channels));
//!
//! let mut plan = compile_with(topology, config.compile_options()).map_err(|f| f.error)?;
//! let mut sink = WavSink::create("out.wav", &config)?;
//! let summary = render_offline(&mut plan, &config, Duration::from_secs(2), &mut sink, &CancelToken::new())?;
//! ```

mod config;
mod offline;
mod session;

pub use config::EngineConfig;
pub use offline::{BlockSink, CancelToken, RenderSummary, VecSink, WavSink, render_offline};
pub use session::{
    ActivePlan, CompileJob, RealtimeRenderer, SessionHandle, session, spawn_render_loop,
};

/// Error types for rendering and session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The topology could not be compiled.
    #[error("compile error: {0}")]
    Compile(#[from] loam_core::CompileError),

    /// The routing graph is invalid.
    #[error("routing error: {0}")]
    Routing(#[from] loam_core::RoutingError),

    /// WAV file write error.
    #[error("WAV file error: {0}")]
    Wav(#[from] hound::Error),

    /// Standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to serialize TOML.
    #[error("failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// A configuration value is out of range or inconsistent with a plan.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The render side of the session has stopped or been dropped.
    #[error("session closed")]
    SessionClosed,

    /// A background compile thread panicked.
    #[error("compile thread panicked")]
    CompileThreadPanicked,
}

/// Convenience result type for rendering operations.
pub type Result<T> = std::result::Result<T, Error>;
