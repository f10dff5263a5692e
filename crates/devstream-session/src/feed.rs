//! Stack and task stream reconciler.
//!
//! Maintains the authoritative in-memory view of the current stack
//! snapshot and the ordered task history, applying inbound deltas and
//! notifying subscribers with full state, never patches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use devstream_core::ControlCommand;
use devstream_core::model::{Stack, Task, Update};
use devstream_core::observer::{ObserverSet, Subscription};
use devstream_transport::{
    ChannelOptions, Connector, Frame, FrameHandler, ReconnectingChannel,
};

#[derive(Default)]
struct FeedState {
    stack: Option<Stack>,
    tasks: Vec<Task>,
    /// Task id to position in `tasks`. Rebuilt after every re-sort.
    index: HashMap<String, usize>,
}

impl FeedState {
    fn reindex(&mut self) {
        self.index = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
    }
}

/// Reconciled view of one session's stack and task streams.
///
/// State is mutated only under its lock and observers are always called
/// with the lock released, so a callback may subscribe or unsubscribe
/// freely. Message ordering is the transport's arrival order; within one
/// envelope the stack update is applied before the task batch.
#[derive(Default)]
pub struct SessionFeed {
    state: Mutex<FeedState>,
    stack_observers: ObserverSet<Stack>,
    task_observers: ObserverSet<[Task]>,
}

impl SessionFeed {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decoded envelope.
    pub fn apply(&self, update: Update) {
        let mut stack_notification = None;
        let mut task_notification = None;

        {
            let mut state = self.state.lock().unwrap();

            if let Some(mut stack) = update.stack_update {
                // Full replacement, never merged with the prior snapshot.
                stack.normalize();
                state.stack = Some(stack.clone());
                stack_notification = Some(stack);
            }

            if let Some(batch) = update.task_update {
                let mut needs_sort = false;

                for delta in batch {
                    if delta.id.is_empty() {
                        // Cannot be addressed for future merges.
                        tracing::debug!("dropping task record without id");
                        continue;
                    }

                    if let Some(&at) = state.index.get(&delta.id) {
                        needs_sort |= state.tasks[at].apply(delta);
                    } else {
                        let mut task = Task::new(delta.id.clone());
                        task.apply(delta);
                        let at = state.tasks.len();
                        state.index.insert(task.id.clone(), at);
                        state.tasks.push(task);
                        needs_sort = true;
                    }
                }

                if needs_sort {
                    // Stable: ties keep their existing relative order.
                    state.tasks.sort_by_key(|t| t.created_ts);
                    state.reindex();
                }

                task_notification = Some(state.tasks.clone());
            }
        }

        if let Some(stack) = stack_notification {
            self.stack_observers.notify(&stack);
        }
        if let Some(tasks) = task_notification {
            self.task_observers.notify(&tasks);
        }
    }

    /// Observe stack snapshots. If a snapshot is already known it is
    /// replayed synchronously before this returns, so a late subscriber
    /// never misses the current frame.
    pub fn observe_stack(&self, observer: impl Fn(&Stack) + Send + Sync + 'static) -> Subscription {
        let observer = Arc::new(observer);
        let delegate = Arc::clone(&observer);
        let (subscription, replay) = {
            let state = self.state.lock().unwrap();
            let sub = self.stack_observers.subscribe(move |s: &Stack| delegate(s));
            (sub, state.stack.clone())
        };
        if let Some(stack) = replay {
            observer(&stack);
        }
        subscription
    }

    /// Observe the task list. The current list (possibly empty) is
    /// replayed synchronously before this returns.
    pub fn observe_tasks(
        &self,
        observer: impl Fn(&[Task]) + Send + Sync + 'static,
    ) -> Subscription {
        let observer = Arc::new(observer);
        let delegate = Arc::clone(&observer);
        let (subscription, replay) = {
            let state = self.state.lock().unwrap();
            let sub = self.task_observers.subscribe(move |t: &[Task]| delegate(t));
            (sub, state.tasks.clone())
        };
        observer(&replay);
        subscription
    }

    /// Current snapshot, if any has been received.
    #[must_use]
    pub fn current_stack(&self) -> Option<Stack> {
        self.state.lock().unwrap().stack.clone()
    }

    /// Current reconciled task list, in `created_ts` order.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().unwrap().tasks.clone()
    }

    /// Tasks still in flight whose scope contains `package_name`.
    ///
    /// A pure filter recomputed on demand; task lists are tens of
    /// entries, not millions.
    #[must_use]
    pub fn tasks_for_package(&self, package_name: &str) -> Vec<Task> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.is_running() && t.scope.iter().any(|p| p == package_name))
            .cloned()
            .collect()
    }
}

impl FrameHandler for SessionFeed {
    fn on_frame(&self, frame: Frame) {
        // The coordinator encodes envelopes as JSON in either frame kind.
        let parsed = match &frame {
            Frame::Text(text) => serde_json::from_str::<Update>(text),
            Frame::Binary(data) => serde_json::from_slice::<Update>(data),
        };
        match parsed {
            Ok(update) => self.apply(update),
            Err(e) => {
                // Fatal to this message only; the stream stays available.
                tracing::warn!("skipping undecodable session frame: {e}");
            }
        }
    }

    fn on_connected(&self, connected: bool) {
        tracing::debug!(connected, "session channel state changed");
    }
}

/// A session feed bound to its own reconnecting channel, with the
/// outbound control path.
pub struct SessionClient {
    feed: Arc<SessionFeed>,
    channel: ReconnectingChannel,
}

impl SessionClient {
    /// Build a client over `connector`. Call
    /// [`ensure_connected`](Self::ensure_connected) to start it.
    #[must_use]
    pub fn new(connector: Box<dyn Connector>, options: ChannelOptions) -> Self {
        let feed = Arc::new(SessionFeed::new());
        let channel = ReconnectingChannel::new(connector, Arc::clone(&feed) as _, options);
        Self { feed, channel }
    }

    /// Start connecting. Idempotent.
    pub fn ensure_connected(&self) {
        self.channel.ensure_connected();
    }

    /// Tear down the channel. Registered observers receive no further
    /// notifications.
    pub fn close(&self) {
        self.channel.close();
    }

    /// The reconciled feed.
    #[must_use]
    pub fn feed(&self) -> &Arc<SessionFeed> {
        &self.feed
    }

    /// Send a control command to the coordinator. Shape-only: no
    /// validation is performed here.
    pub fn send(&self, command: &ControlCommand) {
        match serde_json::to_string(command) {
            Ok(json) => self.channel.send(Frame::Text(json)),
            Err(e) => tracing::debug!("failed to encode control command: {e}"),
        }
    }

    /// Ask the coordinator to re-evaluate the workspace.
    pub fn reload_workspace(&self) {
        self.send(&ControlCommand::reload_workspace());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use devstream_core::model::TaskDelta;
    use devstream_transport::Connection as _;
    use devstream_transport::loopback;

    use super::*;

    fn delta(id: &str, created: i64) -> TaskDelta {
        TaskDelta {
            id: id.into(),
            created_ts: Some(created),
            ..TaskDelta::default()
        }
    }

    fn task_batch(deltas: Vec<TaskDelta>) -> Update {
        Update {
            stack_update: None,
            task_update: Some(deltas),
        }
    }

    #[test]
    fn test_snapshot_wholly_replaces_prior() {
        let feed = SessionFeed::new();

        let s1: Stack = serde_json::from_str(
            r#"{"entry": [{"server": {"package_name": "a", "id": "1"}}]}"#,
        )
        .unwrap();
        let s2: Stack = serde_json::from_str(
            r#"{"entry": [{"server": {"package_name": "b", "id": "2"}}]}"#,
        )
        .unwrap();

        feed.apply(Update {
            stack_update: Some(s1),
            task_update: None,
        });
        feed.apply(Update {
            stack_update: Some(s2),
            task_update: None,
        });

        let current = feed.current_stack().unwrap();
        assert_eq!(current.entry.len(), 1);
        assert_eq!(current.entry[0].server.package_name, "b");
    }

    #[test]
    fn test_task_batch_merges_and_sorts() {
        let feed = SessionFeed::new();

        feed.apply(task_batch(vec![delta("t2", 200), delta("t1", 100)]));
        let ids: Vec<_> = feed.tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t1", "t2"]);

        // Merge without a timestamp change keeps order.
        feed.apply(task_batch(vec![TaskDelta {
            id: "t2".into(),
            completed_ts: Some(300),
            ..TaskDelta::default()
        }]));
        let tasks = feed.tasks();
        assert_eq!(tasks[1].completed_ts, Some(300));

        // A changed creation timestamp triggers a re-sort.
        feed.apply(task_batch(vec![delta("t2", 50)]));
        let ids: Vec<_> = feed.tasks().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t2", "t1"]);
    }

    #[test]
    fn test_task_batch_is_idempotent() {
        let feed = SessionFeed::new();
        let batch = vec![delta("t1", 100), delta("t2", 50)];

        feed.apply(task_batch(batch.clone()));
        let once = feed.tasks();
        feed.apply(task_batch(batch));
        assert_eq!(once, feed.tasks());
    }

    #[test]
    fn test_malformed_task_record_is_dropped() {
        let feed = SessionFeed::new();
        feed.apply(task_batch(vec![TaskDelta::default(), delta("t1", 100)]));
        assert_eq!(feed.tasks().len(), 1);
    }

    #[test]
    fn test_late_subscriber_replays_synchronously() {
        let feed = SessionFeed::new();
        feed.apply(task_batch(vec![delta("t1", 100)]));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _sub = feed.observe_tasks(move |tasks| {
            s.lock()
                .unwrap()
                .push(tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>());
        });

        // Replay happened before observe_tasks returned.
        assert_eq!(*seen.lock().unwrap(), vec![vec!["t1".to_string()]]);
    }

    #[test]
    fn test_stack_subscriber_gets_nothing_before_first_snapshot() {
        let feed = SessionFeed::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _sub = feed.observe_stack(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stack_applied_before_tasks_within_one_envelope() {
        let feed = Arc::new(SessionFeed::new());

        let observed_stack = Arc::new(Mutex::new(None));
        let inner = feed.clone();
        let slot = observed_stack.clone();
        let _sub = feed.observe_tasks(move |_| {
            *slot.lock().unwrap() = Some(inner.current_stack().is_some());
        });

        let update: Update = serde_json::from_str(
            r#"{
                "stack_update": {"entry": [{"server": {"package_name": "a"}}]},
                "task_update": [{"id": "t1", "created_ts": "1"}]
            }"#,
        )
        .unwrap();
        feed.apply(update);

        // The task notification saw the stack already in place.
        assert_eq!(*observed_stack.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_tasks_for_package_filters_running_in_scope() {
        let feed = SessionFeed::new();
        feed.apply(task_batch(vec![
            TaskDelta {
                id: "build".into(),
                created_ts: Some(1),
                scope: Some(vec!["pkg/a".into()]),
                ..TaskDelta::default()
            },
            TaskDelta {
                id: "done".into(),
                created_ts: Some(2),
                completed_ts: Some(3),
                scope: Some(vec!["pkg/a".into()]),
                ..TaskDelta::default()
            },
            TaskDelta {
                id: "other".into(),
                created_ts: Some(4),
                scope: Some(vec!["pkg/b".into()]),
                ..TaskDelta::default()
            },
        ]));

        let running: Vec<_> = feed
            .tasks_for_package("pkg/a")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(running, vec!["build"]);
    }

    #[test]
    fn test_undecodable_frame_is_skipped() {
        let feed = SessionFeed::new();
        feed.on_frame(Frame::text("not json"));
        feed.on_frame(Frame::text(r#"{"task_update": [{"id": "t1", "created_ts": "1"}]}"#));
        assert_eq!(feed.tasks().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replaces_snapshot() {
        let (connector, mut accepted) = loopback::connector();
        let client = SessionClient::new(Box::new(connector), ChannelOptions::default());

        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = snapshots.clone();
        let _sub = client.feed().observe_stack(move |stack| {
            sink.lock()
                .unwrap()
                .push(stack.entry[0].server.package_name.clone());
        });

        client.ensure_connected();

        // First connection delivers package "a", then drops.
        let mut conn = accepted.recv().await.unwrap();
        conn.send(Frame::text(
            r#"{"stack_update": {"entry": [{"server": {"package_name": "a", "id": "1"}}]}}"#,
        ))
        .await
        .unwrap();
        wait_for(|| snapshots.lock().unwrap().len() == 1).await;
        conn.close().await;

        // The channel reconnects and receives a fresh snapshot.
        let mut conn = accepted.recv().await.unwrap();
        conn.send(Frame::text(
            r#"{"stack_update": {"entry": [{"server": {"package_name": "b", "id": "2"}}]}}"#,
        ))
        .await
        .unwrap();
        wait_for(|| snapshots.lock().unwrap().len() == 2).await;

        assert_eq!(*snapshots.lock().unwrap(), vec!["a", "b"]);
        let current = client.feed().current_stack().unwrap();
        assert_eq!(current.entry.len(), 1);
        assert_eq!(current.entry[0].server.package_name, "b");

        client.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_commands_reach_coordinator() {
        let (connector, mut accepted) = loopback::connector();
        let client = SessionClient::new(Box::new(connector), ChannelOptions::default());
        client.ensure_connected();

        let mut conn = accepted.recv().await.unwrap();
        wait_for(|| client.channel.is_connected()).await;
        client.reload_workspace();

        let frame = conn.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::text(r#"{"reloadWorkspace":true}"#));

        client.close();
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }
}
