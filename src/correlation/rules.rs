//! Rule flags: deterministic labels derived from a session's counters,
//! ports and protocol tokens. Pure and independent of I/O.
//!
//! Bump [`RULES_VERSION`] whenever a rule or its default threshold changes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::types::Transport;
use crate::configuration::types::RuleThresholds;

pub const RULES_VERSION: u32 = 1;

const SMB_PORTS: &[u16] = &[139, 445];
const SMB_TOKENS: &[&str] = &["smb", "smb2", "smb3", "nbss"];
const NTLM_TOKENS: &[&str] = &["ntlmssp"];
const RDP_TOKENS: &[&str] = &["rdp", "rdpudp"];
const RDP_PORTS: &[u16] = &[3389];
const TELNET_TOKENS: &[&str] = &["telnet"];
const TELNET_PORTS: &[u16] = &[23];
const FTP_TOKENS: &[&str] = &["ftp", "ftp-data"];
const FTP_PORTS: &[u16] = &[21];
const SNMP_TOKENS: &[&str] = &["snmp"];
const SNMP_PORTS: &[u16] = &[161, 162];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleFlag {
    ManyPackets,
    LongDuration,
    LargeBytes,
    NonTcpUdp,
    SmbTraffic,
    SmbNonstandardPort,
    NtlmAuth,
    RdpTraffic,
    TelnetCleartext,
    FtpCleartext,
    SnmpTraffic,
}

/// Everything the rules look at.
#[derive(Debug, Clone)]
pub struct RuleSignals<'a> {
    pub transport: Transport,
    pub packet_count: u64,
    pub byte_count: u64,
    pub duration_seconds: f64,
    pub ports: [Option<u16>; 2],
    /// Distinct tokens across every protocol chain of the session.
    pub protocol_tokens: BTreeSet<&'a str>,
}

impl<'a> RuleSignals<'a> {
    fn has_token(&self, tokens: &[&str]) -> bool {
        tokens.iter().any(|t| self.protocol_tokens.contains(t))
    }

    fn has_port(&self, ports: &[u16]) -> bool {
        self.ports
            .iter()
            .flatten()
            .any(|port| ports.contains(port))
    }
}

/// Splits protocol chains (`eth:ethertype:ip:tcp:http`) into distinct tokens.
pub fn protocol_tokens<'a, I>(chains: I) -> BTreeSet<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    chains
        .into_iter()
        .flat_map(|chain| chain.split(':'))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Evaluates every rule. Output order is the declaration order of [`RuleFlag`].
pub fn evaluate(signals: &RuleSignals<'_>, thresholds: &RuleThresholds) -> Vec<RuleFlag> {
    let mut flags = Vec::new();

    if signals.packet_count >= thresholds.many_packets {
        flags.push(RuleFlag::ManyPackets);
    }
    if signals.duration_seconds >= thresholds.long_duration_secs {
        flags.push(RuleFlag::LongDuration);
    }
    if signals.byte_count >= thresholds.large_bytes {
        flags.push(RuleFlag::LargeBytes);
    }
    if signals.transport == Transport::Other {
        flags.push(RuleFlag::NonTcpUdp);
    }

    let smb_by_token = signals.has_token(SMB_TOKENS);
    if smb_by_token || (signals.transport == Transport::Tcp && signals.has_port(SMB_PORTS)) {
        flags.push(RuleFlag::SmbTraffic);
    }
    if smb_by_token && !signals.has_port(SMB_PORTS) {
        flags.push(RuleFlag::SmbNonstandardPort);
    }
    if signals.has_token(NTLM_TOKENS) {
        flags.push(RuleFlag::NtlmAuth);
    }
    if signals.has_token(RDP_TOKENS) || signals.has_port(RDP_PORTS) {
        flags.push(RuleFlag::RdpTraffic);
    }
    if signals.has_token(TELNET_TOKENS)
        || (signals.transport == Transport::Tcp && signals.has_port(TELNET_PORTS))
    {
        flags.push(RuleFlag::TelnetCleartext);
    }
    if signals.has_token(FTP_TOKENS)
        || (signals.transport == Transport::Tcp && signals.has_port(FTP_PORTS))
    {
        flags.push(RuleFlag::FtpCleartext);
    }
    if signals.has_token(SNMP_TOKENS)
        || (signals.transport == Transport::Udp && signals.has_port(SNMP_PORTS))
    {
        flags.push(RuleFlag::SnmpTraffic);
    }

    flags
}
