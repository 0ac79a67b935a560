//! Timed command scripts
//!
//! A command script pre-loads configuration changes keyed by elapsed run
//! time, e.g. `1:write_ratio=0.5;2:wait=true;30s:wait=false;2m:stop=`.
//! Times are seconds by default; the `m` suffix multiplies by 60. The
//! program loop pops entries as their time elapses and routes them through
//! the same command path the stdin reader uses.

use crate::error::Fault;
use crate::Result;
use std::collections::VecDeque;

/// One scheduled command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedCommand {
    /// Elapsed run time, in seconds, at which the command fires
    pub at_secs: u64,
    pub command: String,
}

/// Queue of (time, command) pairs in script order
#[derive(Debug, Default)]
pub struct CommandScript {
    queue: VecDeque<TimedCommand>,
}

impl CommandScript {
    /// Parse a script string; an empty string yields an empty queue
    pub fn parse(script: &str) -> Result<Self> {
        let mut queue = VecDeque::new();
        if script.is_empty() {
            return Ok(Self { queue });
        }

        for entry in script.split(';') {
            let (time_str, command) = entry.split_once(':').ok_or_else(|| {
                Fault::Config(format!("invalid command in command_script: {}", entry))
            })?;

            let at_secs = parse_time(time_str.trim())?;
            queue.push_back(TimedCommand {
                at_secs,
                command: command.trim().to_string(),
            });
        }
        Ok(Self { queue })
    }

    /// Pop the next command whose time has elapsed, if any
    pub fn pop_due(&mut self, elapsed_secs: u64) -> Option<TimedCommand> {
        if self
            .queue
            .front()
            .is_some_and(|cmd| cmd.at_secs <= elapsed_secs)
        {
            self.queue.pop_front()
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Parse a script time of the form `<digits>[s|m]`
fn parse_time(value: &str) -> Result<u64> {
    let (digits, multiplier) = match value.strip_suffix('m') {
        Some(rest) => (rest, 60),
        None => (value.strip_suffix('s').unwrap_or(value), 1),
    };

    let secs = digits
        .parse::<u64>()
        .map_err(|_| Fault::Config(format!("invalid time in command_script: {}", value)))?;
    Ok(secs * multiplier)
}
