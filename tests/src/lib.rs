//! Testing utilities for the troupe execution core: mock services with
//! scripted outcomes and call history, plus a harness wiring them to agents
//! over the in-process bus.

pub mod services;

pub use services::{
    FAILURE_REFLECT, InMemoryDirectory, MockCapability, MockReasoner, RecordingFileStore,
    RecordingGateway, RecordingTraffic, Scripted, TestHarness, test_config,
};
