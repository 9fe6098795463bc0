//! Pure TCP follow: direction bucketing, sequence ordering, budgeted rendering
//! and search. The dissector is never touched here.

use std::collections::BTreeSet;

use log::debug;
use regex::{Regex, RegexBuilder};

use super::printable::{render, BudgetedText};
use super::types::*;
use crate::correlation::types::Endpoint;
use crate::error_handling::types::ForensicError;

/// One payload-bearing packet of a stream, payload already decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadPacket {
    pub frame: u64,
    pub ts: f64,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: Option<u64>,
    pub payload: Vec<u8>,
}

/// Directed stream data. Frame and time are absent for data recovered from
/// the dissector's own follow output.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    pub frame: Option<u64>,
    pub ts: Option<f64>,
    pub direction: Direction,
    pub bytes: Vec<u8>,
}

/// Stream data sorted both ways: per direction in sequence order, and overall in capture time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reassembly {
    pub client: Option<Endpoint>,
    pub server: Option<Endpoint>,
    pub directions: [Vec<Piece>; 2],
    pub chronological: Vec<Piece>,
    pub notes: Vec<String>,
}

impl Reassembly {
    pub fn is_empty(&self) -> bool {
        self.chronological.is_empty()
    }
}

/// Buckets packets by the first packet's endpoints and orders each direction
/// by `(seq, frame)`. Identical retransmissions are dropped.
pub fn reassemble(mut packets: Vec<PayloadPacket>) -> Reassembly {
    packets.sort_by_key(|p| p.frame);
    let (client, server) = match packets.first() {
        Some(first) => (first.src.clone(), first.dst.clone()),
        None => return Reassembly::default(),
    };

    let mut notes = Vec::new();
    let mut buckets: [Vec<PayloadPacket>; 2] = [Vec::new(), Vec::new()];
    for packet in packets {
        if packet.src == client {
            buckets[0].push(packet);
        } else if packet.src == server {
            buckets[1].push(packet);
        } else {
            notes.push(format!(
                "frame {} from {} does not belong to {} <-> {}",
                packet.frame, packet.src, client, server
            ));
        }
    }

    let mut retransmissions = 0usize;
    for bucket in buckets.iter_mut() {
        bucket.sort_by_key(|p| (p.seq, p.frame));
        let before = bucket.len();
        bucket.dedup_by(|later, earlier| {
            later.seq.is_some() && later.seq == earlier.seq && later.payload == earlier.payload
        });
        retransmissions += before - bucket.len();
    }
    if retransmissions > 0 {
        notes.push(format!("{} retransmitted segment(s) skipped", retransmissions));
    }

    let to_pieces = |bucket: &[PayloadPacket], direction: Direction| -> Vec<Piece> {
        bucket
            .iter()
            .map(|p| Piece {
                frame: Some(p.frame),
                ts: Some(p.ts),
                direction,
                bytes: p.payload.clone(),
            })
            .collect()
    };
    let directions = [
        to_pieces(&buckets[0], Direction::ClientToServer),
        to_pieces(&buckets[1], Direction::ServerToClient),
    ];

    let mut chronological: Vec<Piece> = directions.iter().flatten().cloned().collect();
    chronological.sort_by(|x, y| {
        let tx = x.ts.unwrap_or(f64::INFINITY);
        let ty = y.ts.unwrap_or(f64::INFINITY);
        tx.total_cmp(&ty).then_with(|| x.frame.cmp(&y.frame))
    });

    Reassembly {
        client: Some(client),
        server: Some(server),
        directions,
        chronological,
        notes,
    }
}

enum Matcher {
    Contains { needle: String, case_sensitive: bool },
    Pattern(Regex),
}

impl Matcher {
    fn new(options: &SearchOptions) -> Result<Self, ForensicError> {
        if options.term.is_empty() {
            return Err(ForensicError::MalformedInput(
                "search term must not be empty".to_string(),
            ));
        }
        Ok(match options.mode {
            MatchMode::Contains if options.case_sensitive => Matcher::Contains {
                needle: options.term.clone(),
                case_sensitive: true,
            },
            MatchMode::Contains => Matcher::Contains {
                needle: options.term.to_lowercase(),
                case_sensitive: false,
            },
            MatchMode::Regex => Matcher::Pattern(
                RegexBuilder::new(&options.term)
                    .case_insensitive(!options.case_sensitive)
                    .build()?,
            ),
        })
    }

    fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Contains {
                needle,
                case_sensitive: true,
            } => text.contains(needle.as_str()),
            Matcher::Contains { needle, .. } => text.to_lowercase().contains(needle.as_str()),
            Matcher::Pattern(re) => re.is_match(text),
        }
    }
}

fn endpoint_label(endpoint: &Option<Endpoint>, fallback: &str) -> String {
    endpoint
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn direction_text(
    reassembly: &Reassembly,
    direction: Direction,
    request: &FollowRequest,
) -> DirectionText {
    let pieces = &reassembly.directions[direction.index()];
    let (src, dst) = match direction {
        Direction::ClientToServer => (reassembly.client.clone(), reassembly.server.clone()),
        Direction::ServerToClient => (reassembly.server.clone(), reassembly.client.clone()),
    };
    let mut text = BudgetedText::new(request.budgets.max_bytes_per_direction);
    if request.direction.includes(direction) {
        for piece in pieces {
            if !text.push_str(&render(&piece.bytes)) {
                break;
            }
        }
    }
    let (text, truncated) = text.into_parts();
    DirectionText {
        src,
        dst,
        packet_count: pieces.len() as u64,
        total_bytes: pieces.iter().map(|p| p.bytes.len() as u64).sum(),
        text,
        truncated,
    }
}

fn combined_text(reassembly: &Reassembly, request: &FollowRequest) -> (String, bool) {
    let client = endpoint_label(&reassembly.client, "client");
    let server = endpoint_label(&reassembly.server, "server");
    let mut text = BudgetedText::new(request.budgets.max_combined_bytes);
    let mut last: Option<Direction> = None;
    for piece in reassembly
        .chronological
        .iter()
        .filter(|p| request.direction.includes(p.direction))
    {
        if last != Some(piece.direction) {
            let (from, to) = match piece.direction {
                Direction::ClientToServer => (&client, &server),
                Direction::ServerToClient => (&server, &client),
            };
            let lead = if text.is_empty() || text.ends_with_newline() {
                ""
            } else {
                "\n"
            };
            if !text.push_str(&format!("{}==> {} -> {}\n", lead, from, to)) {
                break;
            }
            last = Some(piece.direction);
        }
        if !text.push_str(&render(&piece.bytes)) {
            break;
        }
    }
    text.into_parts()
}

fn search(
    reassembly: &Reassembly,
    request: &FollowRequest,
    options: &SearchOptions,
) -> Result<SearchResult, ForensicError> {
    let matcher = Matcher::new(options)?;
    let candidates: Vec<(&Piece, String)> = reassembly
        .chronological
        .iter()
        .filter(|p| request.direction.includes(p.direction))
        .filter(|p| request.range.contains(p.frame, p.ts))
        .map(|p| (p, render(&p.bytes)))
        .collect();

    let matches: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, (_, text))| matcher.is_match(text))
        .map(|(idx, _)| idx)
        .collect();
    let match_count = matches.len();
    let kept = &matches[..match_count.min(options.max_matches)];

    let mut window = BTreeSet::new();
    for &idx in kept {
        let start = idx.saturating_sub(options.context_packets);
        let end = (idx + options.context_packets).min(candidates.len().saturating_sub(1));
        window.extend(start..=end);
    }
    let matched: BTreeSet<usize> = kept.iter().copied().collect();

    let mut truncated = match_count > kept.len();
    let segments: Vec<Segment> = window
        .into_iter()
        .map(|idx| {
            let (piece, rendered) = &candidates[idx];
            let mut text = BudgetedText::new(request.budgets.max_segment_bytes);
            text.push_str(rendered);
            let (text, cut) = text.into_parts();
            truncated |= cut;
            Segment {
                frame: piece.frame,
                ts: piece.ts,
                direction: piece.direction,
                matched: matched.contains(&idx),
                text,
                truncated: cut,
            }
        })
        .collect();

    Ok(SearchResult {
        match_count,
        segments,
        truncated,
    })
}

/// Renders a reassembled stream into a [`FollowResult`].
///
/// Fails only on an invalid search term.
pub fn render_follow(
    source: FollowSource,
    reassembly: Reassembly,
    request: &FollowRequest,
) -> Result<FollowResult, ForensicError> {
    let search = match &request.search {
        Some(options) => Some(search(&reassembly, request, options)?),
        None => None,
    };
    let client_to_server = direction_text(&reassembly, Direction::ClientToServer, request);
    let server_to_client = direction_text(&reassembly, Direction::ServerToClient, request);
    let (combined, combined_truncated) = combined_text(&reassembly, request);
    debug!(
        "tcp stream {}: {} + {} payload byte(s), combined truncated: {}",
        request.stream_id,
        client_to_server.total_bytes,
        server_to_client.total_bytes,
        combined_truncated
    );
    Ok(FollowResult {
        stream_id: request.stream_id,
        source,
        client_to_server,
        server_to_client,
        combined,
        combined_truncated,
        search,
        notes: reassembly.notes,
    })
}
