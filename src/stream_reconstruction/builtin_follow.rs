//! Parser for the dissector's own `-z follow,tcp,ascii,<stream>` report.
//!
//! The report names both nodes, then lists chunks. Each chunk opens with its
//! byte length on a line of its own; node 1 lengths are indented with a tab.
//! The chunk body follows verbatim and may span several lines.

use super::follower::{Piece, Reassembly};
use super::types::Direction;
use crate::correlation::types::Endpoint;

pub fn follow_args(pcap: &str, stream_id: u64) -> Vec<String> {
    vec![
        "-r".to_string(),
        pcap.to_string(),
        "-n".to_string(),
        "-q".to_string(),
        "-z".to_string(),
        format!("follow,tcp,ascii,{}", stream_id),
    ]
}

/// `10.0.0.1:80`, `[fe80::1]:443` or `fe80::1:443`.
fn parse_node(text: &str) -> Option<Endpoint> {
    let (host, port) = text.trim().rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some(Endpoint::new(host, Some(port)))
}

fn chunk_header(line: &str) -> Option<(Direction, usize)> {
    let (direction, digits) = match line.strip_prefix('\t') {
        Some(rest) => (Direction::ServerToClient, rest),
        None => (Direction::ClientToServer, line),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((direction, digits.parse().ok()?))
}

fn is_rule(line: &str) -> bool {
    line.len() >= 10 && line.bytes().all(|b| b == b'=')
}

/// Turns a follow report into a [`Reassembly`]. Unrecognized lines are ignored.
pub fn parse_report(report: &str) -> Reassembly {
    let mut reassembly = Reassembly::default();
    let mut lines = report.lines().peekable();
    let mut in_body = false;

    while let Some(line) = lines.next() {
        if is_rule(line) {
            in_body = false;
            continue;
        }
        if let Some(rest) = line.strip_prefix("Node 0:") {
            reassembly.client = parse_node(rest);
            in_body = true;
            continue;
        }
        if let Some(rest) = line.strip_prefix("Node 1:") {
            reassembly.server = parse_node(rest);
            in_body = true;
            continue;
        }
        if !in_body {
            continue;
        }
        let (direction, length) = match chunk_header(line) {
            Some(header) => header,
            None => continue,
        };

        // Body lines until the declared length is covered, counting the line breaks.
        let mut body: Vec<&str> = Vec::new();
        let mut consumed = 0usize;
        while consumed < length {
            match lines.peek().copied() {
                Some(next) if !is_rule(next) => {
                    consumed += next.len() + 1;
                    body.push(next);
                    lines.next();
                }
                _ => break,
            }
        }
        let mut text = body.join("\n");
        if text.len() < length && consumed >= length {
            text.push('\n');
        }
        if text.is_empty() {
            continue;
        }

        let piece = Piece {
            frame: None,
            ts: None,
            direction,
            bytes: text.into_bytes(),
        };
        reassembly.directions[direction.index()].push(piece.clone());
        reassembly.chronological.push(piece);
    }
    reassembly
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\n===================================================================\nFollow: tcp,ascii\nFilter: tcp.stream eq 0\nNode 0: 10.0.0.1:5000\nNode 1: 10.0.0.2:80\n16\nGET / HTTP/1.1\n\n\n\t17\nHTTP/1.1 200 OK\n\n\n4\n1234\n===================================================================\n";

    #[test]
    fn nodes_and_chunks_are_recovered() {
        let reassembly = parse_report(REPORT);
        assert_eq!(reassembly.client, Some(Endpoint::new("10.0.0.1", Some(5000))));
        assert_eq!(reassembly.server, Some(Endpoint::new("10.0.0.2", Some(80))));
        assert_eq!(reassembly.chronological.len(), 3);

        let first = &reassembly.chronological[0];
        assert_eq!(first.direction, Direction::ClientToServer);
        assert_eq!(first.bytes, b"GET / HTTP/1.1\n\n".to_vec());

        let reply = &reassembly.directions[Direction::ServerToClient.index()];
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].bytes, b"HTTP/1.1 200 OK\n\n".to_vec());

        // A numeric body is not mistaken for a chunk header.
        assert_eq!(reassembly.chronological[2].bytes, b"1234".to_vec());
    }

    #[test]
    fn report_without_data_is_empty() {
        let report = "===================================================================\nFollow: tcp,ascii\nFilter: tcp.stream eq 9\nNode 0: :0\nNode 1: :0\n===================================================================\n";
        let reassembly = parse_report(report);
        assert!(reassembly.is_empty());
        assert_eq!(reassembly.client, None);
    }

    #[test]
    fn ipv6_nodes() {
        assert_eq!(
            parse_node(" [fe80::1]:443"),
            Some(Endpoint::new("fe80::1", Some(443)))
        );
        assert_eq!(parse_node("fe80::1:443"), Some(Endpoint::new("fe80::1", Some(443))));
    }

    #[test]
    fn args_select_the_stream() {
        let args = follow_args("/tmp/a.pcap", 7);
        assert_eq!(args.last().map(String::as_str), Some("follow,tcp,ascii,7"));
    }
}
