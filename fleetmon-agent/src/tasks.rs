//! Duty supervision and process-level guards
//!
//! Every periodic duty runs under a supervisor so one panicking loop
//! cannot silently take a machine out of the fleet.

use std::future::Future;
use std::net::TcpListener;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error};

const RESTART_COOLDOWN: Duration = Duration::from_secs(5);

/// Run a duty until it finishes, panics or the agent shuts down.
///
/// A panic is logged and the duty restarted after a cooldown. A duty
/// that returns on its own is considered done and stays down.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    shutdown: &broadcast::Sender<()>,
    duty: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut signal = shutdown.subscribe();

    tokio::spawn(async move {
        loop {
            let mut run = tokio::spawn(duty());

            tokio::select! {
                outcome = &mut run => {
                    match outcome {
                        Ok(()) => {
                            debug!("Duty {} finished", name);
                            return;
                        }
                        Err(e) if e.is_panic() => {
                            error!(
                                "Duty {} panicked, restarting in {}s",
                                name,
                                RESTART_COOLDOWN.as_secs()
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(RESTART_COOLDOWN) => {}
                                _ = signal.recv() => return,
                            }
                        }
                        Err(_) => return,
                    }
                }
                _ = signal.recv() => {
                    run.abort();
                    debug!("Duty {} stopped", name);
                    return;
                }
            }
        }
    })
}

/// Bind the guard port, or detect another running copy of the agent.
///
/// The listener is held for the life of the process and released by the
/// OS on exit, however the process ends.
pub fn acquire_instance_lock(port: u16) -> Option<TcpListener> {
    TcpListener::bind(("127.0.0.1", port)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_panicked_duty_is_restarted() {
        let (shutdown, _keep) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = spawn_supervised("flaky", &shutdown, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run dies");
                }
            }
        });

        // Second run returns cleanly, so the supervisor winds down.
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_finished_duty_is_not_restarted() {
        let (shutdown, _keep) = broadcast::channel(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = spawn_supervised("oneshot", &shutdown, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_a_running_duty() {
        let (shutdown, _keep) = broadcast::channel(1);
        let handle = spawn_supervised("pending", &shutdown, || std::future::pending::<()>());

        tokio::task::yield_now().await;
        shutdown.send(()).unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(joined.is_ok());
    }

    #[test]
    fn test_instance_lock_is_exclusive() {
        let first = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = first.local_addr().unwrap().port();

        assert!(acquire_instance_lock(port).is_none());

        drop(first);
        assert!(acquire_instance_lock(port).is_some());
    }
}
