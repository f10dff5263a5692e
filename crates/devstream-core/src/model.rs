//! Wire data model for the session update stream.
//!
//! Field names follow the coordinator's proto-JSON encoding (snake_case,
//! 64-bit timestamps encoded as strings or numbers).

use serde::{Deserialize, Serialize};

/// One inbound envelope from the session coordinator.
///
/// Either side may be absent; both may be present in one message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    /// Full replacement snapshot of the stack, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_update: Option<Stack>,
    /// Ordered batch of partial task records, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_update: Option<Vec<TaskDelta>>,
}

/// Snapshot of the stack topology known to the session.
///
/// A snapshot received on the wire wholly replaces the previous one;
/// there is no incremental merge at this level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    #[serde(default, deserialize_with = "wire_u64::deserialize")]
    pub revision: u64,
    #[serde(default)]
    pub abs_root: String,
    /// Package names currently in focus (primary servers). Used for
    /// sort/partition only, not identity.
    #[serde(default)]
    pub focus: Vec<String>,
    #[serde(default)]
    pub entry: Vec<StackEntry>,
    #[serde(default)]
    pub endpoint: Vec<Endpoint>,
    #[serde(default)]
    pub forwarded_port: Vec<ForwardedPort>,
    #[serde(default)]
    pub state: Vec<StackEntryState>,
}

impl Stack {
    /// Re-sort entries deterministically: focus entries first, then
    /// lexicographic by package name. Applied in place immediately after
    /// receipt, before the snapshot is exposed to subscribers.
    pub fn normalize(&mut self) {
        self.entry.sort_by(|a, b| {
            let fa = self.focus.contains(&a.server.package_name);
            let fb = self.focus.contains(&b.server.package_name);
            fb.cmp(&fa)
                .then_with(|| a.server.package_name.cmp(&b.server.package_name))
        });
    }

    /// Per-server state record, if the coordinator reported one.
    #[must_use]
    pub fn state_of(&self, package_name: &str) -> Option<&StackEntryState> {
        self.state.iter().find(|s| s.package_name == package_name)
    }
}

/// One managed server within a stack snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackEntry {
    #[serde(default)]
    pub server: Server,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub name: String,
}

/// Service endpoint exposed by a server. Not uniquely keyed; rendered
/// per snapshot, never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub server_owner: String,
    #[serde(default)]
    pub port: Option<EndpointPort>,
    #[serde(default)]
    pub endpoint_owner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub container_port: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForwardedPort {
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub local_port: i32,
    #[serde(default)]
    pub container_port: i32,
    #[serde(default)]
    pub error: String,
}

/// Last known per-server condition (e.g. a deploy error to surface).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackEntryState {
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub last_error: String,
}

/// A unit of orchestration work, reconciled across deltas by `id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub human_readable_label: String,
    /// Creation timestamp in unix nanoseconds. Primary sort key.
    pub created_ts: i64,
    /// Completion timestamp; `None` while the task is in flight.
    pub completed_ts: Option<i64>,
    /// Package names this task affects.
    pub scope: Vec<String>,
    pub output: Vec<TaskOutput>,
    /// Task was a no-op due to caching.
    pub cached: bool,
    pub error_message: String,
}

impl Task {
    /// Seed a task from the first delta that mentioned its id.
    #[must_use]
    pub fn new(id: String) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// The task is still in flight.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.completed_ts.is_none()
    }

    /// Field-wise overwrite from a partial record: only fields present on
    /// the wire replace prior values. Returns true if `created_ts`
    /// changed, which obliges the owner to re-sort its task list.
    pub fn apply(&mut self, delta: TaskDelta) -> bool {
        if let Some(name) = delta.name {
            self.name = name;
        }
        if let Some(label) = delta.human_readable_label {
            self.human_readable_label = label;
        }
        if let Some(scope) = delta.scope {
            self.scope = scope;
        }
        if let Some(output) = delta.output {
            self.output = output;
        }
        if let Some(cached) = delta.cached {
            self.cached = cached;
        }
        if let Some(message) = delta.error_message {
            self.error_message = message;
        }
        if delta.completed_ts.is_some() {
            self.completed_ts = delta.completed_ts;
        }
        match delta.created_ts {
            Some(ts) if ts != self.created_ts => {
                self.created_ts = ts;
                true
            }
            _ => false,
        }
    }
}

/// Partial task record as it appears in a `task_update` batch.
///
/// Every field other than `id` is optional; absent fields leave the
/// reconciled task untouched. A record with an empty `id` cannot be
/// addressed for future merges and is dropped by the reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDelta {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_readable_label: Option<String>,
    #[serde(
        default,
        with = "wire_i64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_ts: Option<i64>,
    #[serde(
        default,
        with = "wire_i64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<TaskOutput>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Named output stream attached to a task. The content type distinguishes
/// structured build logs from plain text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content_type: String,
}

/// Proto-JSON encodes 64-bit integers as strings; some emitters send
/// plain numbers. Accept both.
pub mod wire_i64 {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum I64OrString {
        Num(i64),
        Str(String),
    }

    impl I64OrString {
        fn parse<E: serde::de::Error>(self) -> Result<i64, E> {
            match self {
                Self::Num(n) => Ok(n),
                Self::Str(s) => s.parse().map_err(E::custom),
            }
        }
    }

    /// Deserialize an `i64` from a JSON number or string.
    ///
    /// # Errors
    /// Returns an error if a string value is not a valid integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        I64OrString::deserialize(d)?.parse()
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        use super::I64OrString;

        /// Deserialize an optional `i64` from a JSON number or string.
        ///
        /// # Errors
        /// Returns an error if a string value is not a valid integer.
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
            Option::<I64OrString>::deserialize(d)?
                .map(I64OrString::parse)
                .transpose()
        }

        /// Serialize an optional `i64` as a string, matching proto-JSON.
        ///
        /// # Errors
        /// Returns an error if the underlying serializer fails.
        pub fn serialize<S: Serializer>(v: &Option<i64>, s: S) -> Result<S::Ok, S::Error> {
            v.as_ref().map(ToString::to_string).serialize(s)
        }
    }
}

/// Unsigned counterpart of [`wire_i64`].
pub mod wire_u64 {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum U64OrString {
        Num(u64),
        Str(String),
    }

    /// Deserialize a `u64` from a JSON number or string.
    ///
    /// # Errors
    /// Returns an error if a string value is not a valid integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match U64OrString::deserialize(d)? {
            U64OrString::Num(n) => Ok(n),
            U64OrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
