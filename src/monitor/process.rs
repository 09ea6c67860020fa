//! Process table snapshots and start/exit detection

use crate::error::Result;
use crate::output::Tabular;
use clap::ValueEnum;
use humansize::{format_size, BINARY};
use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use sysinfo::System;

/// One running process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    /// Process id
    pub pid: u32,
    /// Executable name
    pub name: String,
    /// Full command line
    pub command: String,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// CPU usage in percent of one core
    pub cpu_percent: f32,
}

/// Source of process table snapshots
pub trait ProcessSource {
    /// Current processes
    fn snapshot(&mut self) -> Result<Vec<ProcessRecord>>;
}

/// [`ProcessSource`] backed by sysinfo
pub struct SysinfoSource {
    sys: System,
}

impl SysinfoSource {
    /// Create the source and take the first reading
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_all();
        Self { sys }
    }

    /// Wait long enough for CPU percentages to mean something
    pub fn settle(&mut self) {
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for SysinfoSource {
    fn snapshot(&mut self) -> Result<Vec<ProcessRecord>> {
        self.sys.refresh_all();
        let records = self
            .sys
            .processes()
            .iter()
            .map(|(pid, process)| {
                let command: Vec<String> = process
                    .cmd()
                    .iter()
                    .map(|part| part.to_string_lossy().into_owned())
                    .collect();
                ProcessRecord {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    command: command.join(" "),
                    memory_bytes: process.memory(),
                    cpu_percent: process.cpu_usage(),
                }
            })
            .collect();
        Ok(records)
    }
}

/// Sort order for process listings
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessSortKey {
    /// Highest CPU first
    #[default]
    Cpu,
    /// Largest memory first
    Memory,
    /// Name, ascending
    Name,
    /// Pid, ascending
    Pid,
}

/// Filter, sort and truncate a snapshot
#[derive(Debug, Clone, Default)]
pub struct ProcessQuery {
    /// Case-insensitive substring of the name or command line
    pub name: Option<String>,
    /// Sort order
    pub sort: ProcessSortKey,
    /// Keep only the first N
    pub top: Option<usize>,
}

impl ProcessQuery {
    /// Whether a record passes the name filter
    pub fn matches(&self, record: &ProcessRecord) -> bool {
        match self.name {
            Some(ref needle) => {
                let needle = needle.to_lowercase();
                record.name.to_lowercase().contains(&needle) || record.command.to_lowercase().contains(&needle)
            }
            None => true,
        }
    }

    /// Apply the query
    pub fn apply(&self, records: Vec<ProcessRecord>) -> Vec<ProcessRecord> {
        let mut selected: Vec<ProcessRecord> = records.into_iter().filter(|r| self.matches(r)).collect();
        selected.sort_by(|a, b| match self.sort {
            ProcessSortKey::Cpu => b
                .cpu_percent
                .partial_cmp(&a.cpu_percent)
                .unwrap_or(Ordering::Equal)
                .then(a.pid.cmp(&b.pid)),
            ProcessSortKey::Memory => b.memory_bytes.cmp(&a.memory_bytes).then(a.pid.cmp(&b.pid)),
            ProcessSortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.pid.cmp(&b.pid)),
            ProcessSortKey::Pid => a.pid.cmp(&b.pid),
        });
        if let Some(top) = self.top {
            selected.truncate(top);
        }
        selected
    }
}

/// Process listing for output
pub struct ProcessTable(pub Vec<ProcessRecord>);

impl Tabular for ProcessTable {
    fn columns(&self) -> Vec<String> {
        vec!["pid".into(), "name".into(), "cpu_percent".into(), "memory".into(), "command".into()]
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.0
            .iter()
            .map(|p| {
                vec![
                    json!(p.pid),
                    json!(p.name),
                    json!(format!("{:.1}", p.cpu_percent)),
                    json!(format_size(p.memory_bytes, BINARY)),
                    json!(p.command),
                ]
            })
            .collect()
    }
}

/// Change observed between two polls
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProcessEvent {
    /// A matching process appeared
    Started {
        /// Process id
        pid: u32,
        /// Name
        name: String,
        /// Command line
        command: String,
    },
    /// A previously seen process is gone
    Exited {
        /// Process id
        pid: u32,
        /// Name
        name: String,
    },
}

/// Remembers the processes seen so far and reports starts and exits
pub struct ProcessWatcher<S: ProcessSource> {
    source: S,
    filter: ProcessQuery,
    known: HashMap<u32, ProcessRecord>,
    primed: bool,
}

impl<S: ProcessSource> ProcessWatcher<S> {
    /// Watch processes from `source` that pass `filter`'s name match
    pub fn new(source: S, filter: ProcessQuery) -> Self {
        Self {
            source,
            filter,
            known: HashMap::new(),
            primed: false,
        }
    }

    /// Record the current table without reporting it
    pub fn prime(&mut self) -> Result<usize> {
        self.known = self.current()?;
        self.primed = true;
        Ok(self.known.len())
    }

    /// Processes currently tracked
    pub fn tracked(&self) -> usize {
        self.known.len()
    }

    fn current(&mut self) -> Result<HashMap<u32, ProcessRecord>> {
        Ok(self
            .source
            .snapshot()?
            .into_iter()
            .filter(|r| self.filter.matches(r))
            .map(|r| (r.pid, r))
            .collect())
    }

    /// Take a snapshot and diff it against the previous one
    ///
    /// The first poll primes the watcher and reports nothing. A pid that
    /// reappears under another name counts as an exit plus a start.
    pub fn poll(&mut self) -> Result<Vec<ProcessEvent>> {
        if !self.primed {
            self.prime()?;
            return Ok(Vec::new());
        }

        let current = self.current()?;
        let mut events = Vec::new();

        let mut gone: Vec<&ProcessRecord> = self
            .known
            .values()
            .filter(|old| current.get(&old.pid).map_or(true, |new| new.name != old.name))
            .collect();
        gone.sort_by_key(|r| r.pid);
        events.extend(gone.into_iter().map(|r| ProcessEvent::Exited {
            pid: r.pid,
            name: r.name.clone(),
        }));

        let mut started: Vec<&ProcessRecord> = current
            .values()
            .filter(|new| self.known.get(&new.pid).map_or(true, |old| old.name != new.name))
            .collect();
        started.sort_by_key(|r| r.pid);
        events.extend(started.into_iter().map(|r| ProcessEvent::Started {
            pid: r.pid,
            name: r.name.clone(),
            command: r.command.clone(),
        }));

        self.known = current;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn rec(pid: u32, name: &str, cpu: f32, mem: u64) -> ProcessRecord {
        ProcessRecord {
            pid,
            name: name.into(),
            command: format!("/usr/bin/{} --serve", name),
            memory_bytes: mem,
            cpu_percent: cpu,
        }
    }

    struct Scripted(VecDeque<Vec<ProcessRecord>>);

    impl ProcessSource for Scripted {
        fn snapshot(&mut self) -> Result<Vec<ProcessRecord>> {
            Ok(self.0.pop_front().unwrap_or_default())
        }
    }

    #[test]
    fn test_query_filter_sort_top() {
        let records = vec![
            rec(10, "nginx", 1.0, 300),
            rec(11, "postgres", 9.5, 900),
            rec(12, "nginx", 3.0, 100),
            rec(13, "sshd", 0.0, 50),
        ];
        let query = ProcessQuery {
            name: Some("NGINX".into()),
            sort: ProcessSortKey::Cpu,
            top: None,
        };
        let pids: Vec<u32> = query.apply(records.clone()).iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![12, 10]);

        let query = ProcessQuery {
            name: None,
            sort: ProcessSortKey::Memory,
            top: Some(2),
        };
        let pids: Vec<u32> = query.apply(records).iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![11, 10]);
    }

    #[test]
    fn test_watcher_reports_starts_and_exits() {
        let source = Scripted(VecDeque::from([
            vec![rec(1, "init", 0.0, 1), rec(20, "worker", 0.0, 1)],
            vec![rec(1, "init", 0.0, 1), rec(21, "worker", 0.0, 1)],
            vec![rec(1, "init", 0.0, 1), rec(21, "worker", 0.0, 1)],
            vec![rec(1, "init", 0.0, 1), rec(21, "backup", 0.0, 1)],
        ]));
        let mut watcher = ProcessWatcher::new(source, ProcessQuery::default());

        assert!(watcher.poll().unwrap().is_empty());
        assert_eq!(watcher.tracked(), 2);

        let events = watcher.poll().unwrap();
        assert_eq!(
            events,
            vec![
                ProcessEvent::Exited { pid: 20, name: "worker".into() },
                ProcessEvent::Started {
                    pid: 21,
                    name: "worker".into(),
                    command: "/usr/bin/worker --serve".into()
                },
            ]
        );

        assert!(watcher.poll().unwrap().is_empty());

        // pid reuse under a new name
        let events = watcher.poll().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProcessEvent::Exited { pid: 21, .. }));
        assert!(matches!(events[1], ProcessEvent::Started { pid: 21, ref name, .. } if name == "backup"));
    }

    #[test]
    fn test_watcher_honours_name_filter() {
        let source = Scripted(VecDeque::from([
            vec![rec(1, "init", 0.0, 1)],
            vec![rec(1, "init", 0.0, 1), rec(5, "nginx", 0.0, 1), rec(6, "cron", 0.0, 1)],
        ]));
        let filter = ProcessQuery {
            name: Some("nginx".into()),
            ..Default::default()
        };
        let mut watcher = ProcessWatcher::new(source, filter);
        watcher.prime().unwrap();
        let events = watcher.poll().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ProcessEvent::Started { pid: 5, .. }));
    }

    #[test]
    fn test_sysinfo_sees_this_process() {
        let mut source = SysinfoSource::new();
        let me = std::process::id();
        let snapshot = source.snapshot().unwrap();
        assert!(snapshot.iter().any(|r| r.pid == me));
    }
}
