//! Display segmentation of build step names.
//!
//! A presentation aid, not a correctness-critical parse: image
//! references inside a step name are split out so a renderer can link
//! or highlight them; anything unrecognized stays plain text.

use std::sync::OnceLock;

use regex::Regex;

/// One piece of a step name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Plain(String),
    /// An image reference, e.g. `docker.io/library/node:18`.
    Image(String),
}

fn image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // `docker-image://<ref>` or a bare registry-style reference
        // (host.domain/path:tag).
        Regex::new(
            r"docker-image://(\S+)|(?:[a-z0-9-]+(?:\.[a-z0-9-]+)+)/[A-Za-z0-9._/-]+:[A-Za-z0-9._-]+",
        )
        .expect("image pattern compiles")
    })
}

/// Split a step name into plain and image segments.
///
/// A name with no recognizable reference degrades to a single plain
/// segment.
#[must_use]
pub fn parse_segments(name: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    for caps in image_pattern().captures_iter(name) {
        let whole = caps.get(0).expect("group 0 always present");
        if whole.start() > cursor {
            segments.push(Segment::Plain(name[cursor..whole.start()].to_string()));
        }
        // Group 1 strips the docker-image:// prefix; a bare reference
        // is taken verbatim.
        let reference = caps
            .get(1)
            .map_or_else(|| whole.as_str(), |g| g.as_str());
        segments.push(Segment::Image(reference.to_string()));
        cursor = whole.end();
    }

    if cursor < name.len() || segments.is_empty() {
        segments.push(Segment::Plain(name[cursor..].to_string()));
    }

    segments
}
