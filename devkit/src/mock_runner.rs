/*!
Mock command runner for scenario tests

Answers by exact rendered command line and records every call. Scripted
delays honour the caller's deadline, and triggers let one command change
what later commands answer (an install making a helper appear on PATH).
*/

use async_trait::async_trait;
use credfix_engine::execution::{render_command, CommandOutput, CommandRunner, ExecutionError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum MockResponse {
    Ok(String),
    Exit(i32, String),
    NotFound,
    /// Never answers; the caller's deadline fires
    Hang,
    /// Answers `Ok` after the delay, unless the deadline is shorter
    Delayed(Duration, String),
}

#[derive(Default)]
struct MockState {
    responses: HashMap<String, MockResponse>,
    triggers: HashMap<String, Vec<(String, MockResponse)>>,
    calls: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockRunner {
    state: Arc<Mutex<MockState>>,
}

/// Rendered form of a command, as the runner sees it
pub fn command_line(program: &str, args: &[&str]) -> String {
    render_command(program, args)
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, command: impl Into<String>, response: MockResponse) -> &Self {
        self.state.lock().unwrap().responses.insert(command.into(), response);
        self
    }

    pub fn ok(&self, command: impl Into<String>, stdout: &str) -> &Self {
        self.respond(command, MockResponse::Ok(stdout.to_string()))
    }

    pub fn exit(&self, command: impl Into<String>, code: i32, stderr: &str) -> &Self {
        self.respond(command, MockResponse::Exit(code, stderr.to_string()))
    }

    pub fn delayed(&self, command: impl Into<String>, delay: Duration, stdout: &str) -> &Self {
        self.respond(command, MockResponse::Delayed(delay, stdout.to_string()))
    }

    /// After `command` succeeds, `then` answers with `response`
    pub fn on_success(&self, command: impl Into<String>, then: impl Into<String>, response: MockResponse) -> &Self {
        self.state
            .lock()
            .unwrap()
            .triggers
            .entry(command.into())
            .or_default()
            .push((then.into(), response));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| *c == command).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn fire_triggers(&self, command: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(triggered) = state.triggers.get(command).cloned() else { return; };
        for (then, response) in triggered {
            log::debug!("🔀 [MOCK] {} now answers {:?}", then, response);
            state.responses.insert(then, response);
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput, ExecutionError> {
        let command = render_command(program, args);
        let response = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(command.clone());
            state.responses.get(&command).cloned().unwrap_or(MockResponse::NotFound)
        };
        log::debug!("▶️ [MOCK] {} -> {:?}", command, response);

        let timed_out = |command: String| ExecutionError::Timeout {
            command,
            timeout_ms: timeout.as_millis() as u64,
        };

        let stdout = match response {
            MockResponse::Ok(stdout) => stdout,
            MockResponse::Exit(exit_code, stderr) => {
                return Err(ExecutionError::NonZeroExit {
                    command,
                    exit_code,
                    stdout: String::new(),
                    stderr,
                })
            }
            MockResponse::NotFound => {
                return Err(ExecutionError::SpawnFailure {
                    command,
                    message: "No such file or directory (os error 2)".to_string(),
                    not_found: true,
                })
            }
            MockResponse::Hang => {
                tokio::time::sleep(timeout).await;
                return Err(timed_out(command));
            }
            MockResponse::Delayed(delay, stdout) => {
                if delay > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(timed_out(command));
                }
                tokio::time::sleep(delay).await;
                stdout
            }
        };

        self.fire_triggers(&command);
        Ok(CommandOutput::success(stdout))
    }
}
