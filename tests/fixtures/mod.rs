//! Test fixtures for multi-node scenarios.

mod two_node;

pub use two_node::{RecordingListener, TwoNodeFixture, test_config, wait_until};
