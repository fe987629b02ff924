/*!
# Credfix DevKit - test tooling for the diagnostic engine

- `MockRunner`: scripted command runner with call log, delays and triggers
- `ScriptedDecisions` / `RecordingSink`: unattended doctor runs
- `ConfigFixture` / `TestHarness`: temp Docker configs and a wired probe context
- `scenario_test!`: one-line scenario tests on a fresh harness
*/

pub mod decisions;
pub mod mock_runner;
pub mod test_utils;

pub use anyhow;
pub use decisions::{RecordingSink, ScriptedDecisions};
pub use mock_runner::{command_line, MockResponse, MockRunner};
pub use test_utils::{ConfigFixture, TestHarness};
