//! Server configuration document.
//!
//! The file is held as an ordered list of segments that concatenate back to the exact
//! input text. Tagged peer blocks become [`Stanza`]s: the marker comment
//! `# Client: {name} - added {timestamp}`, the `[Peer]` section that follows it, and the
//! one blank line separating it from whatever precedes it. A marker written directly below
//! other text owns that text's line break instead. Everything else (the
//! `[Interface]` block, hand-written untagged peers, comments) is kept verbatim as raw text.
//! Removing a peer is therefore filter-and-serialize, never line skipping.

use std::{collections::BTreeSet, fmt::Write as _, net::Ipv4Addr};

use chrono::{DateTime, Local};
use ipnet::Ipv4Net;

pub const MARKER_PREFIX: &str = "# Client: ";
const MARKER_ADDED: &str = " - added ";
pub const MARKER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub label: String,
    pub public_key: Option<String>,
    pub allowed_ips: Vec<String>,
    text: String,
    /// Starts with the line break of the preceding text rather than a blank line.
    joined: bool,
}

impl Stanza {
    pub fn text(&self) -> &str {
        &self.text
    }

    fn from_lines(label: String, lines: &[&str], joined: bool) -> Self {
        let mut public_key = None;
        let mut allowed_ips = Vec::new();
        for (key, value) in lines.iter().filter_map(|l| key_value(l)) {
            if key.eq_ignore_ascii_case("PublicKey") {
                public_key = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("AllowedIPs") {
                allowed_ips.extend(split_list(value));
            }
        }
        Self {
            label,
            public_key,
            allowed_ips,
            text: lines.concat(),
            joined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Raw(String),
    Stanza(Stanza),
}

impl Segment {
    fn text(&self) -> &str {
        match self {
            Segment::Raw(s) => s,
            Segment::Stanza(s) => &s.text,
        }
    }
}

/// Result of asking the document to drop a tagged peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
    Removed(Stanza),
    NotFound,
    /// A stanza carries the label but a different public key; nothing was removed.
    KeyMismatch { found: Option<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfigDoc {
    segments: Vec<Segment>,
}

/// Lines of the block being accumulated during parsing.
struct Pending<'a> {
    label: Option<String>,
    lines: Vec<&'a str>,
    seen_section: bool,
    joined: bool,
}

impl<'a> Pending<'a> {
    fn raw(lines: Vec<&'a str>) -> Self {
        Self {
            label: None,
            lines,
            seen_section: false,
            joined: false,
        }
    }

    fn into_segment(self) -> Option<Segment> {
        match self.label {
            Some(label) => Some(Segment::Stanza(Stanza::from_lines(label, &self.lines, self.joined))),
            None if self.lines.is_empty() => None,
            None => Some(Segment::Raw(self.lines.concat())),
        }
    }

    /// Detach the trailing lines for which `keep` holds so they can lead the next block.
    fn split_tail(&mut self, keep: impl Fn(&str) -> bool) -> Vec<&'a str> {
        let cut = self
            .lines
            .iter()
            .rposition(|l| !keep(l))
            .map_or(0, |i| i + 1);
        self.lines.split_off(cut)
    }

    /**
     * @brief Lead-in for a marker that follows this block.
     * Exactly one preceding blank line moves to the marker; further blank lines stay put.
     * With none, the marker takes the line break ending this block.
     * @return Lines to prepend to the stanza, and whether it took a line break.
     */
    fn take_lead(&mut self) -> (Vec<&'a str>, bool) {
        let mut blanks = self.split_tail(is_blank);
        if let Some(separator) = blanks.pop() {
            self.lines.extend(blanks);
            return (vec![separator], false);
        }
        match self.lines.last_mut() {
            Some(last) if last.ends_with('\n') => {
                let text: &'a str = *last;
                let (body, newline) = text.split_at(text.len() - 1);
                *last = body;
                (vec![newline], true)
            }
            _ => (Vec::new(), false),
        }
    }
}

impl ServerConfigDoc {
    pub fn parse(content: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = Pending::raw(Vec::new());

        for line in content.split_inclusive('\n') {
            if let Some(label) = parse_marker(line) {
                let (mut lines, joined) = current.take_lead();
                lines.push(line);
                let finished = std::mem::replace(
                    &mut current,
                    Pending {
                        label: Some(label),
                        lines,
                        seen_section: false,
                        joined,
                    },
                );
                segments.extend(finished.into_segment());
                continue;
            }

            if current.label.is_some() && is_section_header(line) {
                if current.seen_section {
                    // A second section ends the tagged block; its lead-in comments go with it.
                    let mut lines = current.split_tail(|l| is_blank(l) || is_comment(l));
                    lines.push(line);
                    let finished = std::mem::replace(&mut current, Pending::raw(lines));
                    segments.extend(finished.into_segment());
                    continue;
                }
                current.seen_section = true;
            }
            current.lines.push(line);
        }
        segments.extend(current.into_segment());

        Self { segments }
    }

    pub fn render(&self) -> String {
        self.segments.iter().map(Segment::text).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.text().is_empty())
    }

    pub fn stanzas(&self) -> impl Iterator<Item = &Stanza> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Stanza(st) => Some(st),
            Segment::Raw(_) => None,
        })
    }

    pub fn find(&self, label: &str) -> Option<&Stanza> {
        self.stanzas().find(|s| s.label == label)
    }

    /// Whether any `[Peer]` section, tagged or not, carries this public key.
    pub fn contains_key(&self, public_key: &str) -> bool {
        peer_entries(&self.render(), "PublicKey")
            .iter()
            .any(|k| k == public_key)
    }

    /**
     * @brief Append a tagged peer block at the end of the document.
     * @param label Peer name written into the marker comment.
     * @param public_key Peer public key.
     * @param allowed_ip Server-side route for the peer, normally a /32.
     * @param added_at Timestamp written into the marker comment.
     */
    pub fn append_stanza(
        &mut self,
        label: &str,
        public_key: &str,
        allowed_ip: &str,
        added_at: DateTime<Local>,
    ) {
        let rendered = self.render();
        // A blank line after complete lines, or just the missing line break.
        let joined = !rendered.is_empty() && !rendered.ends_with('\n');
        let mut text = String::new();
        if !rendered.is_empty() {
            text.push('\n');
        }
        let _ = writeln!(
            text,
            "{MARKER_PREFIX}{label}{MARKER_ADDED}{}",
            added_at.format(MARKER_TIME_FORMAT)
        );
        text.push_str("[Peer]\n");
        let _ = writeln!(text, "PublicKey = {public_key}");
        let _ = writeln!(text, "AllowedIPs = {allowed_ip}");

        self.segments.push(Segment::Stanza(Stanza {
            label: label.to_string(),
            public_key: Some(public_key.to_string()),
            allowed_ips: vec![allowed_ip.to_string()],
            text,
            joined,
        }));
    }

    /**
     * @brief Remove exactly the stanza tagged with `label` (and, when given, `public_key`).
     * All other segments are left byte-for-byte untouched.
     */
    pub fn remove_stanza(&mut self, label: &str, public_key: Option<&str>) -> Removal {
        let Some(idx) = self.segments.iter().position(|s| match s {
            Segment::Stanza(st) => {
                st.label == label && public_key.is_none_or(|k| st.public_key.as_deref() == Some(k))
            }
            Segment::Raw(_) => false,
        }) else {
            return match self.find(label) {
                Some(st) => Removal::KeyMismatch {
                    found: st.public_key.clone(),
                },
                None => Removal::NotFound,
            };
        };

        match self.segments.remove(idx) {
            Segment::Stanza(st) => {
                // The borrowed line break still ends the text before it.
                if st.joined && idx < self.segments.len() {
                    self.segments.insert(idx, Segment::Raw("\n".into()));
                }
                Removal::Removed(st)
            }
            Segment::Raw(_) => Removal::NotFound,
        }
    }

    /// Host addresses routed as single-host entries by any `[Peer]` inside `subnet`.
    pub fn used_addresses(&self, subnet: &Ipv4Net) -> BTreeSet<Ipv4Addr> {
        peer_entries(&self.render(), "AllowedIPs")
            .iter()
            .filter_map(|v| host_address(v))
            .filter(|ip| subnet.contains(ip))
            .collect()
    }
}

/// All comma-separated values of `key` across every `[Peer]` section of `content`.
fn peer_entries(content: &str, key: &str) -> Vec<String> {
    let mut in_peer = false;
    let mut out = Vec::new();
    for line in content.lines().map(str::trim) {
        if is_section_header(line) {
            in_peer = line.eq_ignore_ascii_case("[Peer]");
            continue;
        }
        if !in_peer {
            continue;
        }
        if let Some((k, v)) = key_value(line) {
            if k.eq_ignore_ascii_case(key) {
                out.extend(split_list(v));
            }
        }
    }
    out
}

fn parse_marker(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix(MARKER_PREFIX)?;
    let label = rest.split(MARKER_ADDED).next().unwrap_or(rest).trim();
    (!label.is_empty()).then(|| label.to_string())
}

/// `"10.0.0.5/32"` or a bare `"10.0.0.5"` to an address; wider prefixes are not host routes.
pub fn host_address(value: &str) -> Option<Ipv4Addr> {
    let value = value.trim();
    match value.split_once('/') {
        Some((ip, "32")) => ip.trim().parse().ok(),
        Some(_) => None,
        None => value.parse().ok(),
    }
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || is_comment(line) {
        return None;
    }
    line.split_once('=').map(|(k, v)| (k.trim(), v.trim()))
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn is_comment(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with('#') || line.starts_with(';')
}

fn is_section_header(line: &str) -> bool {
    let line = line.trim();
    line.starts_with('[') && line.ends_with(']')
}
