//! Trace wire events and the reconciled invocation model.
//!
//! The wire format is newline-delimited JSON: each record carries a
//! session id plus optionally a start marker, a completion marker, or a
//! solve-status envelope with vertex and status arrays.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use crate::segment::{Segment, parse_segments};

/// One newline-delimited trace record.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireEvent {
    /// Build session identifier.
    #[serde(rename = "s", default)]
    pub session_id: String,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    /// Nested vertex/status arrays from the build execution trace.
    #[serde(rename = "e", default)]
    pub envelope: Option<SolveStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SolveStatus {
    #[serde(rename = "Vertexes", default)]
    pub vertexes: Vec<WireVertex>,
    #[serde(rename = "Statuses", default)]
    pub statuses: Vec<WireStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireVertex {
    /// Content digest, the merge key.
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cached: Option<bool>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireStatus {
    /// Status identifier, scoped to its owning vertex. Anonymous
    /// statuses carry no durable state and are dropped.
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    /// Digest of the owning vertex.
    #[serde(default)]
    pub vertex: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub current: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
}

/// A progress event nested under a build step. Kept in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexStatus {
    pub id: String,
    pub name: String,
    pub parts: Vec<Segment>,
    pub current: i64,
    pub total: i64,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl VertexStatus {
    /// Elapsed time, known only when both endpoints were reported.
    #[must_use]
    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.completed? - self.started?)
    }
}

/// One build step, reconciled across trace events by content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexEvent {
    pub digest: String,
    pub name: String,
    /// Display segmentation of `name`; re-derived whenever the name
    /// changes.
    pub parts: Vec<Segment>,
    pub cached: bool,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    /// Failure message reported for this step, if any.
    pub error: Option<String>,
    /// Sub-statuses in insertion order. Step ordering matters; status
    /// ordering within a step is append-order.
    pub statuses: Vec<VertexStatus>,
}

impl VertexEvent {
    fn new(digest: String) -> Self {
        Self {
            digest,
            name: String::new(),
            parts: parse_segments(""),
            cached: false,
            started: None,
            completed: None,
            error: None,
            statuses: Vec::new(),
        }
    }

    /// Elapsed time, known only when both endpoints were reported on
    /// this vertex. One endpoint is never inferred from the other.
    #[must_use]
    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.completed? - self.started?)
    }
}

/// One build execution's structured log.
#[derive(Debug, Clone)]
pub struct BuildInvocation {
    pub id: String,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    vertices: HashMap<String, VertexEvent>,
    /// Vertex digests in tidy order (insertion order between tidies).
    order: Vec<String>,
}

impl BuildInvocation {
    /// An invocation cannot be observed mid-flight: it only comes into
    /// existence from an event carrying its start marker.
    #[must_use]
    pub fn new(id: String, started: DateTime<Utc>) -> Self {
        Self {
            id,
            started,
            completed: None,
            vertices: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Fold one trace record into this invocation.
    pub fn ingest(&mut self, event: WireEvent) {
        if let Some(envelope) = event.envelope {
            for vertex in envelope.vertexes {
                self.ingest_vertex(vertex);
            }
            for status in envelope.statuses {
                self.ingest_status(status);
            }
        }
        if event.completed.is_some() {
            self.completed = event.completed;
        }
    }

    fn ingest_vertex(&mut self, wire: WireVertex) {
        if wire.digest.is_empty() {
            tracing::debug!("dropping vertex without digest");
            return;
        }

        let vertex = match self.vertices.entry(wire.digest.clone()) {
            std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                self.order.push(wire.digest.clone());
                slot.insert(VertexEvent::new(wire.digest))
            }
        };

        if let Some(cached) = wire.cached {
            vertex.cached = cached;
        }
        if wire.started.is_some() {
            vertex.started = wire.started;
        }
        if wire.completed.is_some() {
            vertex.completed = wire.completed;
        }
        if wire.error.is_some() {
            vertex.error = wire.error;
        }
        if let Some(name) = wire.name {
            if name != vertex.name {
                vertex.parts = parse_segments(&name);
                vertex.name = name;
            }
        }
    }

    fn ingest_status(&mut self, wire: WireStatus) {
        // Anonymous statuses are ephemeral by design, not an error.
        let Some(id) = wire.id.filter(|id| !id.is_empty()) else {
            tracing::debug!("dropping status without id");
            return;
        };
        // Out-of-order status for a vertex we have not seen.
        let Some(vertex) = self.vertices.get_mut(&wire.vertex) else {
            tracing::debug!(vertex = %wire.vertex, "dropping status for unknown vertex");
            return;
        };

        // Linear scan; per-vertex status cardinality is small.
        let found = vertex.statuses.iter().position(|s| s.id == id);
        let at = found.unwrap_or_else(|| {
            vertex.statuses.push(VertexStatus {
                name: id.clone(),
                parts: parse_segments(&id),
                id: id.clone(),
                current: 0,
                total: 0,
                started: None,
                completed: None,
            });
            vertex.statuses.len() - 1
        });
        let status = &mut vertex.statuses[at];

        if let Some(name) = wire.name {
            if name != status.name {
                status.parts = parse_segments(&name);
                status.name = name;
            }
        }
        if let Some(current) = wire.current {
            status.current = current;
        }
        if let Some(total) = wire.total {
            status.total = total;
        }
        if wire.started.is_some() {
            status.started = wire.started;
        }
        if wire.completed.is_some() {
            status.completed = wire.completed;
        }
    }

    /// Re-sort the vertex order by start instant. Vertices lacking a
    /// start sort first and keep their insertion order among themselves.
    /// Invoked once per frame batch, not per event.
    pub fn tidy(&mut self) {
        let vertices = &self.vertices;
        self.order.sort_by(|a, b| {
            let sa = vertices.get(a).and_then(|v| v.started);
            let sb = vertices.get(b).and_then(|v| v.started);
            match (sa, sb) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
    }

    /// Read-only view of vertices in tidy order.
    pub fn vertices(&self) -> impl Iterator<Item = &VertexEvent> {
        self.order.iter().filter_map(|digest| self.vertices.get(digest))
    }

    /// Vertex by digest.
    #[must_use]
    pub fn vertex(&self, digest: &str) -> Option<&VertexEvent> {
        self.vertices.get(digest)
    }

    /// Total build time, known once the completion marker arrived.
    #[must_use]
    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.completed? - self.started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_wire_event_parsing() {
        let raw = r#"{"s":"b1","started":"2024-01-01T00:00:00Z","e":{"Vertexes":[{"Digest":"sha256:d1","Name":"step","Started":"2024-01-01T00:00:01Z"}],"Statuses":[{"ID":"pulling","Vertex":"sha256:d1","Current":5,"Total":10}]}}"#;
        let event: WireEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.session_id, "b1");
        assert_eq!(event.started, Some(ts("2024-01-01T00:00:00Z")));

        let envelope = event.envelope.unwrap();
        assert_eq!(envelope.vertexes[0].digest, "sha256:d1");
        assert_eq!(envelope.statuses[0].id.as_deref(), Some("pulling"));
        assert_eq!(envelope.statuses[0].current, Some(5));
    }

    #[test]
    fn test_duration_requires_both_endpoints() {
        let mut inv = BuildInvocation::new("b1".into(), ts("2024-01-01T00:00:00Z"));
        inv.ingest_vertex(WireVertex {
            digest: "d1".into(),
            completed: Some(ts("2024-01-01T00:00:05Z")),
            ..WireVertex::default()
        });
        // Completed without started: no duration is inferred.
        assert_eq!(inv.vertex("d1").unwrap().duration(), None);

        inv.ingest_vertex(WireVertex {
            digest: "d1".into(),
            started: Some(ts("2024-01-01T00:00:00Z")),
            ..WireVertex::default()
        });
        assert_eq!(
            inv.vertex("d1").unwrap().duration(),
            Some(TimeDelta::seconds(5))
        );
    }

    #[test]
    fn test_name_change_rederives_parts() {
        let mut inv = BuildInvocation::new("b1".into(), ts("2024-01-01T00:00:00Z"));
        inv.ingest_vertex(WireVertex {
            digest: "d1".into(),
            name: Some("resolve".into()),
            ..WireVertex::default()
        });
        inv.ingest_vertex(WireVertex {
            digest: "d1".into(),
            name: Some("docker-image://docker.io/library/node:18".into()),
            ..WireVertex::default()
        });

        let vertex = inv.vertex("d1").unwrap();
        assert_eq!(
            vertex.parts,
            vec![Segment::Image("docker.io/library/node:18".into())]
        );
    }

    #[test]
    fn test_status_for_unknown_vertex_is_dropped() {
        let mut inv = BuildInvocation::new("b1".into(), ts("2024-01-01T00:00:00Z"));
        inv.ingest_status(WireStatus {
            id: Some("pulling".into()),
            vertex: "missing".into(),
            ..WireStatus::default()
        });
        assert_eq!(inv.vertices().count(), 0);
    }

    #[test]
    fn test_anonymous_status_is_dropped() {
        let mut inv = BuildInvocation::new("b1".into(), ts("2024-01-01T00:00:00Z"));
        inv.ingest_vertex(WireVertex {
            digest: "d1".into(),
            ..WireVertex::default()
        });
        inv.ingest_status(WireStatus {
            id: None,
            vertex: "d1".into(),
            ..WireStatus::default()
        });
        assert!(inv.vertex("d1").unwrap().statuses.is_empty());
    }

    #[test]
    fn test_statuses_merge_by_id_in_insertion_order() {
        let mut inv = BuildInvocation::new("b1".into(), ts("2024-01-01T00:00:00Z"));
        inv.ingest_vertex(WireVertex {
            digest: "d1".into(),
            ..WireVertex::default()
        });

        inv.ingest_status(WireStatus {
            id: Some("pulling".into()),
            vertex: "d1".into(),
            started: Some(ts("2024-01-01T00:00:01Z")),
            ..WireStatus::default()
        });
        inv.ingest_status(WireStatus {
            id: Some("extracting".into()),
            vertex: "d1".into(),
            ..WireStatus::default()
        });
        inv.ingest_status(WireStatus {
            id: Some("pulling".into()),
            vertex: "d1".into(),
            completed: Some(ts("2024-01-01T00:00:03Z")),
            ..WireStatus::default()
        });

        let statuses = &inv.vertex("d1").unwrap().statuses;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].id, "pulling");
        assert_eq!(statuses[0].duration(), Some(TimeDelta::seconds(2)));
        assert_eq!(statuses[1].id, "extracting");
    }

    #[test]
    fn test_tidy_sorts_started_after_unstarted() {
        let mut inv = BuildInvocation::new("b1".into(), ts("2024-01-01T00:00:00Z"));
        for (digest, started) in [
            ("late", Some(ts("2024-01-01T00:00:09Z"))),
            ("pending-a", None),
            ("early", Some(ts("2024-01-01T00:00:01Z"))),
            ("pending-b", None),
        ] {
            inv.ingest_vertex(WireVertex {
                digest: digest.into(),
                started,
                ..WireVertex::default()
            });
        }

        inv.tidy();

        let order: Vec<_> = inv.vertices().map(|v| v.digest.as_str()).collect();
        // Unstarted first, in insertion order; started by start time.
        assert_eq!(order, vec!["pending-a", "pending-b", "early", "late"]);
    }
}
