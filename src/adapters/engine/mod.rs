//! Container engine adapters.

pub mod mock;

pub use mock::MockContainerEngine;
