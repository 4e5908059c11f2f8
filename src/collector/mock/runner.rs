//! In-memory command runner for testing counter readers.

use crate::collector::traits::{CommandOutput, CommandRunner};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;

/// Scripted reply to a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// The program ran and produced this output.
    Output(CommandOutput),
    /// The program binary does not exist.
    NotFound,
}

/// Command runner answering from a script instead of spawning processes.
///
/// Responses are queued per command line (`program arg1 arg2 ...`). Each
/// call pops the next response; the last one is repeated once the queue
/// is down to a single entry.
#[derive(Debug, Default)]
pub struct MockRunner {
    responses: Mutex<HashMap<String, VecDeque<MockResponse>>>,
    calls: Mutex<Vec<String>>,
}

impl MockRunner {
    /// Creates a runner with no scripted commands.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `response` for the given command line.
    pub fn push(&self, command_line: impl Into<String>, response: MockResponse) {
        if let Ok(mut map) = self.responses.lock() {
            map.entry(command_line.into()).or_default().push_back(response);
        }
    }

    /// Queues a successful run printing `stdout`.
    pub fn push_stdout(&self, command_line: impl Into<String>, stdout: impl Into<String>) {
        self.push(
            command_line,
            MockResponse::Output(CommandOutput::success(stdout)),
        );
    }

    /// Command lines executed so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn command_line(program: &str, args: &[&str]) -> String {
        std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let line = Self::command_line(program, args);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }

        let response = {
            let mut map = self
                .responses
                .lock()
                .map_err(|_| io::Error::other("mock runner poisoned"))?;
            match map.get_mut(&line) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match response {
            Some(MockResponse::Output(out)) => Ok(out),
            Some(MockResponse::NotFound) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", program),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no scripted response for `{}`", line),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_runner_pops_then_repeats_last() {
        let runner = MockRunner::new();
        runner.push_stdout("tool -a", "one");
        runner.push_stdout("tool -a", "two");

        assert_eq!(runner.run("tool", &["-a"]).unwrap().stdout, "one");
        assert_eq!(runner.run("tool", &["-a"]).unwrap().stdout, "two");
        assert_eq!(runner.run("tool", &["-a"]).unwrap().stdout, "two");
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn test_mock_runner_not_found() {
        let runner = MockRunner::new();
        runner.push("missing", MockResponse::NotFound);
        let err = runner.run("missing", &[]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err = runner.run("unscripted", &["x"]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
