// bw-test-utils: Shared test utilities for the BotWave suites.
//
// Provides a scripted mock agent for exercising the controller's session
// layer and a recording fake modulator for driving the real agent without
// transmitter hardware.

pub mod fake_modulator;
pub mod mock_agent;

pub use fake_modulator::{FakeModulator, StartRecord, StartSource};
pub use mock_agent::MockAgent;
