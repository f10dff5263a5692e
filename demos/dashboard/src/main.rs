//! Example dashboard wiring against an in-process coordinator.
//!
//! Run with: cargo run -p dashboard-demo
//!
//! A scripted coordinator pushes a stack snapshot, task lifecycle
//! deltas, a build trace, and terminal output over loopback channels;
//! the reconciled views are printed as they update.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use devstream_buildlog::BuildLogAssembler;
use devstream_session::{OutputClient, SessionClient};
use devstream_transport::{
    ChannelOptions, Connection as _, Frame, ReconnectingChannel, loopback,
    loopback::LoopbackConnection,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let session = start_session_view();
    let (buildlog_channel, assembler) = start_buildlog_view();
    let output = start_terminal_view();

    // Poke the control path once everything is connected.
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.reload_workspace();
    output.send_resize(120, 40);
    output.send_stdin(b"ls\n");

    tokio::time::sleep(Duration::from_secs(1)).await;

    tracing::info!(
        invocations = assembler.invocations().len(),
        tasks = session.feed().tasks().len(),
        "final reconciled state"
    );

    session.close();
    buildlog_channel.close();
    output.close();
    Ok(())
}

fn start_session_view() -> SessionClient {
    let (connector, accepted) = loopback::connector();
    let client = SessionClient::new(Box::new(connector), ChannelOptions::default());

    let _stack = client.feed().observe_stack(|stack| {
        let names: Vec<_> = stack
            .entry
            .iter()
            .map(|e| e.server.package_name.as_str())
            .collect();
        tracing::info!(?names, revision = stack.revision, "stack updated");
    });
    let _tasks = client.feed().observe_tasks(|tasks| {
        for task in tasks {
            tracing::info!(
                id = %task.id,
                name = %task.name,
                running = task.is_running(),
                "task"
            );
        }
    });
    client.ensure_connected();
    tokio::spawn(session_coordinator(accepted));
    client
}

/// Scripted coordinator side of the session channel.
async fn session_coordinator(mut accepted: mpsc::UnboundedReceiver<LoopbackConnection>) {
    let Some(mut conn) = accepted.recv().await else {
        return;
    };

    let frames = [
        r#"{"stack_update":{"revision":"1","focus":["acme/api"],"entry":[{"server":{"id":"1","package_name":"acme/web"}},{"server":{"id":"2","package_name":"acme/api"}}]}}"#
            .to_string(),
        r#"{"task_update":[{"id":"t1","name":"build","created_ts":"1700000000000000000","scope":["acme/api"]}]}"#
            .to_string(),
        r#"{"task_update":[{"id":"t1","completed_ts":"1700000004000000000"}]}"#.to_string(),
    ];

    for frame in frames {
        if conn.send(Frame::Text(frame)).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn start_buildlog_view() -> (ReconnectingChannel, Arc<BuildLogAssembler>) {
    let assembler = Arc::new(BuildLogAssembler::new());
    let (connector, mut accepted) = loopback::connector();
    let channel = ReconnectingChannel::new(
        Box::new(connector),
        Arc::clone(&assembler) as _,
        ChannelOptions {
            auto_reconnect: false,
        },
    );

    let _sub = assembler.observe(|invocations| {
        for invocation in invocations {
            for vertex in invocation.vertices() {
                tracing::info!(
                    invocation = %invocation.id,
                    step = %vertex.name,
                    cached = vertex.cached,
                    done = vertex.completed.is_some(),
                    "build step"
                );
            }
        }
    });
    channel.ensure_connected();

    tokio::spawn(async move {
        let Some(mut conn) = accepted.recv().await else {
            return;
        };
        let build_id = Uuid::new_v4();
        let lines = format!(
            concat!(
                r#"{{"s":"{id}","started":"2024-01-01T00:00:00Z"}}"#,
                "\n",
                r#"{{"s":"{id}","e":{{"Vertexes":[{{"Digest":"sha256:aa","Name":"docker-image://docker.io/library/node:18","Started":"2024-01-01T00:00:00Z"}}]}}}}"#,
                "\n",
                r#"{{"s":"{id}","e":{{"Vertexes":[{{"Digest":"sha256:aa","Completed":"2024-01-01T00:00:05Z"}}]}},"completed":"2024-01-01T00:00:05Z"}}"#,
                "\n",
            ),
            id = build_id
        );
        let _ = conn.send(Frame::binary(lines.into_bytes())).await;
    });

    (channel, assembler)
}

fn start_terminal_view() -> OutputClient {
    let (connector, mut accepted) = loopback::connector();
    let client = OutputClient::new(Box::new(connector), ChannelOptions::default());

    let _sub = client.stream().observe(|chunk| {
        if chunk.first {
            tracing::info!("-- terminal cleared --");
        }
        tracing::info!(bytes = chunk.data.len(), "terminal output");
    });
    client.ensure_connected();

    // Echo coordinator: acknowledges control messages with output bytes.
    tokio::spawn(async move {
        let Some(mut conn) = accepted.recv().await else {
            return;
        };
        let _ = conn.send(Frame::binary(&b"$ "[..])).await;
        while let Some(Ok(frame)) = conn.recv().await {
            if let Frame::Text(control) = frame {
                let reply = format!("ack {control}\r\n");
                if conn.send(Frame::binary(reply.into_bytes())).await.is_err() {
                    break;
                }
            }
        }
    });

    client
}
