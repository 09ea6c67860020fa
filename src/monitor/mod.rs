//! Process and port monitoring
//!
//! Watchers keep what they have seen in an explicit context object and report
//! differences on each poll. [`poll_loop`] drives them at a fixed interval.

mod port;
mod process;

pub use port::*;
pub use process::*;

use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest sleep between stop flag checks
pub const STOP_CHECK: Duration = Duration::from_millis(100);

/// Call `tick` every `interval` until `stop` is set or `max_polls` ticks ran
///
/// Returns the number of ticks. The stop flag is also checked while sleeping,
/// so a flag set from another thread ends the loop within [`STOP_CHECK`].
pub fn poll_loop<F>(interval: Duration, stop: &AtomicBool, max_polls: Option<usize>, mut tick: F) -> Result<usize>
where
    F: FnMut() -> Result<()>,
{
    let mut polls = 0;
    while !stop.load(Ordering::SeqCst) {
        if max_polls.is_some_and(|max| polls >= max) {
            break;
        }
        tick()?;
        polls += 1;

        if max_polls.is_some_and(|max| polls >= max) {
            break;
        }
        let wake = Instant::now() + interval;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= wake {
                break;
            }
            std::thread::sleep((wake - now).min(STOP_CHECK));
        }
    }
    Ok(polls)
}

/// Stop flag that is set when the process receives Ctrl-C
///
/// The handler runs on its own thread with a single-threaded runtime, so the
/// synchronous watchers can keep polling [`poll_loop`] with a plain flag.
pub fn stop_on_interrupt() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    std::thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        tracing::info!("Received Ctrl-C, stopping after the current poll");
                        flag.store(true, Ordering::SeqCst);
                    }
                    Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {}", e),
                }
            });
        })?;
    Ok(stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_loop_honours_count() {
        let stop = AtomicBool::new(false);
        let mut ticks = 0;
        let polls = poll_loop(Duration::ZERO, &stop, Some(3), || {
            ticks += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(polls, 3);
        assert_eq!(ticks, 3);
    }

    #[test]
    fn test_poll_loop_stops_on_flag() {
        let stop = AtomicBool::new(false);
        let polls = poll_loop(Duration::from_secs(3600), &stop, None, || {
            stop.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(polls, 1);
    }

    #[test]
    fn test_poll_loop_wakes_when_flag_set_elsewhere() {
        let stop = Arc::new(AtomicBool::new(false));
        let setter = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                stop.store(true, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        let polls = poll_loop(Duration::from_secs(3600), &stop, None, || Ok(())).unwrap();
        setter.join().unwrap();
        assert_eq!(polls, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_interrupt_flag_starts_clear() {
        let stop = stop_on_interrupt().unwrap();
        assert!(!stop.load(Ordering::SeqCst));
        let polls = poll_loop(Duration::ZERO, &stop, Some(2), || Ok(())).unwrap();
        assert_eq!(polls, 2);
    }

    #[test]
    fn test_poll_loop_propagates_errors() {
        let stop = AtomicBool::new(false);
        let result = poll_loop(Duration::ZERO, &stop, None, || Err(crate::error::OpsError::config("boom")));
        assert!(result.is_err());
    }
}
