//! Build log stream assembler.
//!
//! Consumes newline-delimited JSON trace events off a binary channel and
//! maintains the set of build invocations for a session, notifying
//! observers with the full ordered view after each frame batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use devstream_core::observer::{ObserverSet, Subscription};
use devstream_transport::{Frame, FrameHandler};

use crate::event::{BuildInvocation, WireEvent};

#[derive(Default)]
struct AssemblerState {
    invocations: HashMap<String, BuildInvocation>,
    /// Invocation ids, re-sorted by invocation start after each batch.
    ids: Vec<String>,
    /// Partial trailing line carried between frames.
    buf: String,
}

/// Reconciler for structured build-step event streams.
#[derive(Default)]
pub struct BuildLogAssembler {
    state: Mutex<AssemblerState>,
    observers: ObserverSet<[BuildInvocation]>,
}

impl BuildLogAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the wire. Complete lines are parsed and
    /// applied; a trailing partial line waits for the next feed. Tidy
    /// and notification happen once per feed, not per event.
    pub fn feed(&self, data: &[u8]) {
        let snapshot = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.buf.push_str(&String::from_utf8_lossy(data));

            while let Some(newline) = state.buf.find('\n') {
                let line = state.buf[..newline].to_string();
                state.buf.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WireEvent>(&line) {
                    Ok(event) => apply(state, event),
                    Err(e) => tracing::warn!("skipping undecodable trace event: {e}"),
                }
            }

            let ids = state.ids.clone();
            for id in &ids {
                if let Some(invocation) = state.invocations.get_mut(id) {
                    invocation.tidy();
                }
            }
            let invocations = &state.invocations;
            state
                .ids
                .sort_by_key(|id| invocations.get(id).map(|inv| inv.started));

            ordered(state)
        };

        self.observers.notify(&snapshot);
    }

    /// Observe the invocation set. The current view is replayed
    /// synchronously before this returns.
    pub fn observe(
        &self,
        observer: impl Fn(&[BuildInvocation]) + Send + Sync + 'static,
    ) -> Subscription {
        let observer = Arc::new(observer);
        let delegate = Arc::clone(&observer);
        let (subscription, replay) = {
            let state = self.state.lock().unwrap();
            let sub = self
                .observers
                .subscribe(move |invocations: &[BuildInvocation]| delegate(invocations));
            (sub, ordered(&state))
        };
        observer(&replay);
        subscription
    }

    /// Current invocations, ordered by invocation start.
    #[must_use]
    pub fn invocations(&self) -> Vec<BuildInvocation> {
        ordered(&self.state.lock().unwrap())
    }
}

fn apply(state: &mut AssemblerState, event: WireEvent) {
    if event.session_id.is_empty() {
        tracing::debug!("dropping trace event without session id");
        return;
    }

    if !state.invocations.contains_key(&event.session_id) {
        // An invocation cannot be observed mid-flight: events that
        // precede its start marker are dropped.
        let Some(started) = event.started else {
            tracing::debug!(session = %event.session_id, "dropping event before start marker");
            return;
        };
        state.ids.push(event.session_id.clone());
        state.invocations.insert(
            event.session_id.clone(),
            BuildInvocation::new(event.session_id.clone(), started),
        );
    }

    if let Some(invocation) = state.invocations.get_mut(&event.session_id) {
        invocation.ingest(event);
    }
}

fn ordered(state: &AssemblerState) -> Vec<BuildInvocation> {
    state
        .ids
        .iter()
        .filter_map(|id| state.invocations.get(id))
        .cloned()
        .collect()
}

impl FrameHandler for BuildLogAssembler {
    fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::Binary(data) => self.feed(&data),
            Frame::Text(text) => self.feed(text.as_bytes()),
        }
    }

    fn on_connected(&self, connected: bool) {
        if connected {
            // A partial line from a dropped connection is garbage.
            self.state.lock().unwrap().buf.clear();
        }
    }
}
