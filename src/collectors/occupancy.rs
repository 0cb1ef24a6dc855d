use crate::config::OccupancyMode;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent<'a> {
    Connected(&'a str),
    Disconnected(&'a str),
}

#[derive(Debug, Clone)]
pub struct EventPatterns {
    connected: Regex,
    disconnected: Regex,
}

impl EventPatterns {
    pub fn new(connect_marker: &str, disconnect_marker: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            connected: marker_pattern(connect_marker)?,
            disconnected: marker_pattern(disconnect_marker)?,
        })
    }

    pub fn scan<'a>(&self, log: &'a str) -> Vec<LogEvent<'a>> {
        let mut found: Vec<(usize, usize, LogEvent<'a>)> = Vec::new();
        for (re, connected) in [(&self.connected, true), (&self.disconnected, false)] {
            for caps in re.captures_iter(log) {
                let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                let event = if connected {
                    LogEvent::Connected(name.as_str())
                } else {
                    LogEvent::Disconnected(name.as_str())
                };
                found.push((whole.start(), whole.end(), event));
            }
        }
        found.sort_by_key(|(start, end, _)| (*start, Reverse(*end)));

        // one marker may sit inside the other ("connected: " in "disconnected: ")
        let mut covered = 0;
        let mut events = Vec::with_capacity(found.len());
        for (start, end, event) in found {
            if start < covered {
                continue;
            }
            covered = end;
            events.push(event);
        }
        events
    }
}

fn marker_pattern(marker: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("{}(.+?),", regex::escape(marker)))
}

pub fn occupants(events: &[LogEvent<'_>], mode: OccupancyMode) -> Vec<String> {
    match mode {
        OccupancyMode::SetDifference => set_difference(events),
        OccupancyMode::SessionPaired => session_paired(events),
    }
}

// a name that reconnected after a disconnect inside the window is absent
fn set_difference(events: &[LogEvent<'_>]) -> Vec<String> {
    let disconnected: HashSet<&str> = events
        .iter()
        .filter_map(|e| match e {
            LogEvent::Disconnected(name) => Some(*name),
            LogEvent::Connected(_) => None,
        })
        .collect();

    let mut out: Vec<String> = Vec::new();
    for event in events {
        if let LogEvent::Connected(name) = event {
            if !disconnected.contains(name) && !out.iter().any(|n| n == name) {
                out.push((*name).to_string());
            }
        }
    }
    out
}

fn session_paired(events: &[LogEvent<'_>]) -> Vec<String> {
    let mut sessions: Vec<(&str, u32)> = Vec::new();
    for event in events {
        match event {
            LogEvent::Connected(name) => {
                match sessions.iter().position(|(n, _)| n == name) {
                    Some(idx) if sessions[idx].1 > 0 => sessions[idx].1 += 1,
                    Some(idx) => {
                        sessions.remove(idx);
                        sessions.push((*name, 1));
                    }
                    None => sessions.push((*name, 1)),
                }
            }
            LogEvent::Disconnected(name) => {
                if let Some(entry) = sessions.iter_mut().find(|(n, _)| n == name) {
                    entry.1 = entry.1.saturating_sub(1);
                }
            }
        }
    }

    sessions
        .into_iter()
        .filter(|(_, open)| *open > 0)
        .map(|(name, _)| name.to_string())
        .collect()
}
