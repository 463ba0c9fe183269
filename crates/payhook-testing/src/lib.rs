//! Test infrastructure for the payhook pipeline.
//!
//! Provides event fixtures, processors with scripted behaviour, a recording
//! lifecycle subscriber and a harness that wires a pipeline to a test clock
//! and inspectable in-memory stores.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod events;
pub mod fixtures;
pub mod harness;
pub mod processors;
pub mod property;

pub use events::{RecordingEventHandler, DEFAULT_EVENT_TIMEOUT};
pub use fixtures::EventBuilder;
pub use harness::{init_test_tracing, PipelineHarness};
pub use payhook_core::TestClock;
pub use processors::ScriptedProcessor;
pub use property::proptest_config;
