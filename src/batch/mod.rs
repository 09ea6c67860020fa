//! Bounded fan-out over many targets
//!
//! Each target runs as an independent job on a dedicated rayon pool sized to
//! the throttle. Jobs share nothing; outcomes come back over a channel in the
//! order they finish, and one failing target never stops the others.

use crate::error::{IoResultExt, OpsError, Result};
use crate::output::Tabular;
use crate::progress::ProgressReporter;
use crossbeam::channel::unbounded;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Placeholder replaced by the target in command templates
pub const TARGET_PLACEHOLDER: &str = "{}";

/// Result of one target
#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    /// Target name
    pub target: String,
    /// Whether the job succeeded
    pub success: bool,
    /// Job output on success, error message on failure
    pub detail: String,
    /// Wall-clock time of the job
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}

/// All outcomes of a run, in completion order
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Outcomes as they arrived
    pub outcomes: Vec<TargetOutcome>,
    /// Whole run
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl BatchReport {
    /// Failed outcomes
    pub fn failures(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    /// Number of failed targets
    pub fn failed(&self) -> usize {
        self.failures().count()
    }

    /// Error when any target failed
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failed();
        if failed > 0 {
            return Err(OpsError::BatchFailed {
                failed,
                total: self.outcomes.len(),
            });
        }
        Ok(self)
    }
}

impl Tabular for BatchReport {
    fn columns(&self) -> Vec<String> {
        vec!["target".into(), "status".into(), "duration_ms".into(), "detail".into()]
    }

    fn rows(&self) -> Vec<Vec<Value>> {
        self.outcomes
            .iter()
            .map(|o| {
                vec![
                    json!(o.target),
                    json!(if o.success { "ok" } else { "failed" }),
                    json!(o.duration.as_millis() as u64),
                    json!(first_line(&o.detail)),
                ]
            })
            .collect()
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

/// Runs one job per target with at most `throttle` in flight
#[derive(Debug, Clone)]
pub struct BatchRunner {
    throttle: usize,
}

impl BatchRunner {
    /// Runner with `throttle` concurrent jobs (0 means one per CPU)
    pub fn new(throttle: usize) -> Self {
        let throttle = if throttle == 0 { num_cpus::get() } else { throttle };
        Self { throttle }
    }

    /// Concurrency limit
    pub fn throttle(&self) -> usize {
        self.throttle
    }

    /// Run `job` for every target
    pub fn run<F>(&self, targets: &[String], job: F, progress: Option<&ProgressReporter>) -> Result<BatchReport>
    where
        F: Fn(&str) -> Result<String> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.throttle.min(targets.len().max(1)))
            .thread_name(|i| format!("batch-{}", i))
            .build()
            .map_err(|e| OpsError::ThreadPoolError(e.to_string()))?;

        tracing::info!("Running {} target(s), {} at a time", targets.len(), self.throttle);
        let started = Instant::now();
        let (tx, rx) = unbounded::<TargetOutcome>();
        let job = &job;
        let pool = &pool;

        let outcomes = std::thread::scope(|scope| {
            scope.spawn(move || {
                pool.scope(|s| {
                    for target in targets {
                        let tx = tx.clone();
                        s.spawn(move |_| {
                            let begun = Instant::now();
                            let result = job(target);
                            let outcome = TargetOutcome {
                                target: target.clone(),
                                success: result.is_ok(),
                                detail: match result {
                                    Ok(out) => out,
                                    Err(e) => e.to_string(),
                                },
                                duration: begun.elapsed(),
                            };
                            // receiver outlives every sender
                            let _ = tx.send(outcome);
                        });
                    }
                });
            });

            let mut outcomes = Vec::with_capacity(targets.len());
            for outcome in rx.iter() {
                if outcome.success {
                    tracing::debug!("{} finished in {:?}", outcome.target, outcome.duration);
                } else {
                    tracing::warn!("{} failed: {}", outcome.target, first_line(&outcome.detail));
                }
                if let Some(p) = progress {
                    p.target_finished(&outcome.target, outcome.success, first_line(&outcome.detail));
                }
                outcomes.push(outcome);
            }
            outcomes
        });

        if let Some(p) = progress {
            p.finish();
        }
        Ok(BatchReport {
            outcomes,
            elapsed: started.elapsed(),
        })
    }
}

/// External command with `{}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    argv: Vec<String>,
}

impl CommandTemplate {
    /// Template from program and arguments
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            return Err(OpsError::MissingParameter("command to run".into()));
        }
        Ok(Self { argv })
    }

    /// Argument vector for one target; without any placeholder the target is appended
    pub fn render(&self, target: &str) -> Vec<String> {
        let mut argv: Vec<String> = self
            .argv
            .iter()
            .map(|a| a.replace(TARGET_PLACEHOLDER, target))
            .collect();
        if !self.argv.iter().any(|a| a.contains(TARGET_PLACEHOLDER)) {
            argv.push(target.to_string());
        }
        argv
    }

    /// Run for one target and return trimmed stdout
    pub fn execute(&self, target: &str) -> Result<String> {
        let argv = self.render(target);
        let display = argv.join(" ");
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| OpsError::io(&argv[0], e))?;

        if !output.status.success() {
            return Err(OpsError::CommandFailed {
                command: display,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Targets from text: one per line, `#` comments and blanks skipped, duplicates dropped
pub fn parse_targets(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect()
}

/// Targets from a file
pub fn load_targets(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).with_path(path)?;
    Ok(parse_targets(&text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_every_target_gets_an_outcome() {
        let targets = names(&["a", "b", "bad", "c"]);
        let report = BatchRunner::new(2)
            .run(
                &targets,
                |t| {
                    if t == "bad" {
                        Err(OpsError::InvalidArgument("boom".into()))
                    } else {
                        Ok(format!("hello {}", t))
                    }
                },
                None,
            )
            .unwrap();

        assert_eq!(report.outcomes.len(), 4);
        assert_eq!(report.failed(), 1);
        let bad = report.failures().next().unwrap();
        assert_eq!(bad.target, "bad");
        assert!(bad.detail.contains("boom"));
        assert!(matches!(report.into_result(), Err(OpsError::BatchFailed { failed: 1, total: 4 })));
    }

    #[test]
    fn test_throttle_bounds_concurrency() {
        let targets: Vec<String> = (0..12).map(|i| format!("t{}", i)).collect();
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        BatchRunner::new(3)
            .run(
                &targets,
                |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(String::new())
                },
                None,
            )
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_results_arrive_in_completion_order() {
        let targets = names(&["slow", "fast"]);
        let order = Mutex::new(Vec::new());
        let report = BatchRunner::new(2)
            .run(
                &targets,
                |t| {
                    if t == "slow" {
                        std::thread::sleep(Duration::from_millis(200));
                    }
                    order.lock().unwrap().push(t.to_string());
                    Ok(String::new())
                },
                None,
            )
            .unwrap();
        let reported: Vec<&str> = report.outcomes.iter().map(|o| o.target.as_str()).collect();
        assert_eq!(reported, vec!["fast", "slow"]);
    }

    #[test]
    fn test_progress_is_fed() {
        let progress = ProgressReporter::disabled(2);
        BatchRunner::new(1)
            .run(&names(&["x", "y"]), |_| Ok(String::new()), Some(&progress))
            .unwrap();
        assert_eq!(progress.summary().succeeded, 2);
    }

    #[test]
    fn test_template_rendering() {
        let template = CommandTemplate::new(names(&["ssh", "{}", "uptime"])).unwrap();
        assert_eq!(template.render("web01"), names(&["ssh", "web01", "uptime"]));

        let template = CommandTemplate::new(names(&["ping", "-c", "1"])).unwrap();
        assert_eq!(template.render("db01"), names(&["ping", "-c", "1", "db01"]));

        assert!(CommandTemplate::new(vec![]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_template_execution() {
        let template = CommandTemplate::new(names(&["echo", "host={}"])).unwrap();
        assert_eq!(template.execute("web01").unwrap(), "host=web01");

        let failing = CommandTemplate::new(names(&["sh", "-c", "echo {} >&2; exit 3"])).unwrap();
        match failing.execute("db01") {
            Err(OpsError::CommandFailed { status, stderr, .. }) => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "db01");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_target_file() {
        use std::io::Write;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# fleet\nweb01\n\n  web02  \nweb01\n").unwrap();
        assert_eq!(load_targets(file.path()).unwrap(), names(&["web01", "web02"]));
    }
}
