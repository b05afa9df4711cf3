use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
}

/// One filesystem change, keyed by the entity id parsed from its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub key: String,
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Trailing debounce per key: a change is emitted once `window` has passed
/// without another change for the same key. The latest change wins.
pub struct ChangeDebouncer {
    window: Duration,
}

impl ChangeDebouncer {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub async fn run(
        self,
        mut input: mpsc::UnboundedReceiver<RawChange>,
        output: mpsc::UnboundedSender<RawChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut pending: HashMap<String, (RawChange, Instant)> = HashMap::new();

        loop {
            let next_deadline = pending.values().map(|(_, at)| *at).min();
            let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = shutdown.changed() => {
                    if !pending.is_empty() {
                        debug!(dropped = pending.len(), "cancelling pending changes");
                    }
                    break;
                }
                change = input.recv() => match change {
                    Some(change) => {
                        trace!(key = %change.key, kind = ?change.kind, "change received");
                        let settle_at = Instant::now() + self.window;
                        pending.insert(change.key.clone(), (change, settle_at));
                    }
                    None => break,
                },
                _ = sleep_until(wake_at), if next_deadline.is_some() => {
                    let now = Instant::now();
                    let mut due: Vec<(RawChange, Instant)> = Vec::new();
                    pending.retain(|_, (change, at)| {
                        if *at <= now {
                            due.push((change.clone(), *at));
                            false
                        } else {
                            true
                        }
                    });
                    due.sort_by_key(|(_, at)| *at);
                    for (change, _) in due {
                        debug!(key = %change.key, kind = ?change.kind, "change settled");
                        if output.send(change).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    struct Running {
        input: mpsc::UnboundedSender<RawChange>,
        output: mpsc::UnboundedReceiver<RawChange>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(window: Duration) -> Running {
        let (input, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(ChangeDebouncer::new(window).run(input_rx, output_tx, shutdown_rx));
        Running {
            input,
            output,
            shutdown,
            task,
        }
    }

    fn change(key: &str, kind: ChangeKind) -> RawChange {
        RawChange {
            key: key.into(),
            kind,
            path: PathBuf::from(format!("/t/todo/{key}_x.md")),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_for_one_key_emits_once() {
        let mut running = start(Duration::from_secs(3));
        for _ in 0..5 {
            running.input.send(change("ENG-1", ChangeKind::Added)).unwrap();
            sleep(Duration::from_millis(200)).await;
        }

        let settled = timeout(Duration::from_secs(10), running.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.key, "ENG-1");
        assert_eq!(settled.kind, ChangeKind::Added);

        sleep(Duration::from_secs(10)).await;
        assert!(running.output.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn each_event_resets_the_window() {
        let mut running = start(Duration::from_secs(3));
        let begin = Instant::now();
        running.input.send(change("ENG-1", ChangeKind::Added)).unwrap();
        sleep(Duration::from_secs(2)).await;
        running.input.send(change("ENG-1", ChangeKind::Added)).unwrap();

        running.output.recv().await.unwrap();
        assert!(begin.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn latest_kind_wins_and_keys_are_independent() {
        let mut running = start(Duration::from_secs(3));
        running.input.send(change("ENG-1", ChangeKind::Removed)).unwrap();
        running.input.send(change("ENG-2", ChangeKind::Added)).unwrap();
        running.input.send(change("ENG-1", ChangeKind::Added)).unwrap();

        let mut settled = vec![
            running.output.recv().await.unwrap(),
            running.output.recv().await.unwrap(),
        ];
        settled.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(settled[0], change("ENG-1", ChangeKind::Added));
        assert_eq!(settled[1], change("ENG-2", ChangeKind::Added));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_changes() {
        let mut running = start(Duration::from_secs(3));
        running.input.send(change("ENG-1", ChangeKind::Added)).unwrap();
        sleep(Duration::from_millis(100)).await;

        running.shutdown.send(true).unwrap();
        running.task.await.unwrap();
        assert!(running.output.recv().await.is_none());
    }
}
