//! Ping probe implementation with native ICMP (high-precision) and command fallback.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.
//! Each attempt sends `count_packets` echo requests of `packet_size` payload
//! bytes and reports min/avg/max round trip and packet loss.

use async_trait::async_trait;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{resolve_host, Deadline, ProbeDriver, ProbeError, ProbeOutcome};
use crate::check::{CheckDefinition, CheckKind, CheckTarget};
use crate::db::Timings;

/// Shortest wait for a single echo reply.
const MIN_PACKET_WAIT: Duration = Duration::from_millis(100);

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Round-trip statistics of one ping attempt, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PingStats {
    pub sent: u16,
    pub received: u16,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

impl PingStats {
    fn from_samples(sent: u16, rtts: &[f64]) -> Self {
        if rtts.is_empty() {
            return Self {
                sent,
                ..Default::default()
            };
        }
        let min = rtts.iter().copied().fold(f64::INFINITY, f64::min);
        let max = rtts.iter().copied().fold(0.0, f64::max);
        Self {
            sent,
            received: rtts.len() as u16,
            min,
            avg: rtts.iter().sum::<f64>() / rtts.len() as f64,
            max,
        }
    }

    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 100.0;
        }
        let lost = self.sent.saturating_sub(self.received) as f64;
        (lost * 100.0 / self.sent as f64 * 100.0).round() / 100.0
    }
}

pub struct PingDriver {
    /// Loss percentage at or above which the attempt fails.
    loss_threshold: f64,
}

impl PingDriver {
    pub fn new(loss_threshold: f64) -> Self {
        Self { loss_threshold }
    }

    fn outcome(&self, stats: PingStats, timeout: Duration) -> Result<ProbeOutcome, ProbeError> {
        if stats.received == 0 {
            return Err(ProbeError::Timeout(timeout));
        }

        let loss = stats.loss_percent();
        let timings = Timings {
            response_time: Some(stats.avg),
            min_resp_time: Some(stats.min),
            avg_resp_time: Some(stats.avg),
            max_resp_time: Some(stats.max),
            packet_loss_percent: Some(loss),
            ..Default::default()
        };

        if loss >= self.loss_threshold {
            return Ok(ProbeOutcome::failed(
                timings,
                format!("{}% packet loss ({} of {} replies)", loss, stats.received, stats.sent),
            ));
        }

        let mut outcome = ProbeOutcome::ok(timings);
        if loss > 0.0 {
            outcome.degraded = true;
            outcome.message = format!("{}% packet loss", loss);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl ProbeDriver for PingDriver {
    fn kind(&self) -> CheckKind {
        CheckKind::Ping
    }

    async fn execute(
        &self,
        def: &CheckDefinition,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let CheckTarget::Ping(target) = &def.target else {
            return Err(ProbeError::Config(format!("check {} is not a ping check", def.id)));
        };
        let count = target.count_packets.max(1);
        let stats = run_ping_probe(&target.ip, target.packet_size as usize, count, timeout).await?;
        self.outcome(stats, timeout)
    }
}

/// Run a ping probe against the given address.
pub async fn run_ping_probe(
    address: &str,
    payload_size: usize,
    count: u16,
    timeout: Duration,
) -> Result<PingStats, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        // Resolve address before spawn_blocking (DNS is async)
        let deadline = Deadline::new(timeout);
        let ip = resolve_host(address, 0, &deadline).await?.ip();
        let budget = deadline.remaining();

        // Run blocking ICMP in dedicated thread for precise timing
        let result = tokio::task::spawn_blocking(move || {
            run_blocking_ping(ip, payload_size, count, budget)
        })
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Network(msg)) if msg.starts_with("Permission denied") => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
            }
            other => return other,
        }
    }

    // Fallback to command execution
    run_ping_command(address, payload_size, count, timeout).await
}

fn open_socket(ip: IpAddr) -> Result<(Socket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };
    // Try RAW first (privileged), then DGRAM (unprivileged)
    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|s| (s, false))
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProbeError::Network(format!("Permission denied: {}", e))
            } else {
                ProbeError::Network(format!("Failed to create ICMP socket: {}", e))
            }
        })
}

/// Send `count` echo requests and collect round trips.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(
    ip: IpAddr,
    payload_size: usize,
    count: u16,
    budget: Duration,
) -> Result<PingStats, ProbeError> {
    let started = Instant::now();
    let (socket, raw) = open_socket(ip)?;
    let v6 = ip.is_ipv6();

    socket
        .set_write_timeout(Some(budget.max(Duration::from_millis(1))))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let identifier: u16 = rand::random();
    let per_packet = (budget / count as u32).max(MIN_PACKET_WAIT);
    let mut rtts = Vec::with_capacity(count as usize);
    let mut sent = 0u16;

    for _ in 0..count {
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let packet = build_echo_request(v6, identifier, sequence, payload_size);

        // Start timing just before send
        let start = Instant::now();
        socket.send(&packet).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProbeError::Network(format!("Permission denied: {}", e))
            } else {
                ProbeError::Network(format!("Failed to send: {}", e))
            }
        })?;
        sent += 1;

        let wait = per_packet.min(remaining);
        if let Some(rtt) = await_reply(&socket, v6, raw, identifier, sequence, start, wait)? {
            rtts.push(rtt.as_secs_f64() * 1000.0);
        }
    }

    Ok(PingStats::from_samples(sent, &rtts))
}

/// Wait up to `wait` for our reply; `None` means the packet was lost.
fn await_reply(
    socket: &Socket,
    v6: bool,
    raw: bool,
    identifier: u16,
    sequence: u16,
    start: Instant,
    wait: Duration,
) -> Result<Option<Duration>, ProbeError> {
    // Receive reply - loop until we get OUR reply or timeout
    loop {
        let left = wait.saturating_sub(start.elapsed());
        if left.is_zero() {
            return Ok(None);
        }
        socket
            .set_read_timeout(Some(left.max(Duration::from_millis(1))))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(None)
            }
            Err(e) => return Err(ProbeError::Network(format!("Failed to receive: {}", e))),
        };
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();

        if let Some((id, seq)) = parse_echo_reply(buf, v6, raw) {
            // Unprivileged DGRAM sockets get their id rewritten by the kernel.
            if seq == sequence && (!raw || id == identifier) {
                return Ok(Some(elapsed));
            }
        }
        // Received something else, keep waiting
    }
}

/// Extract (identifier, sequence) from an echo reply, skipping the IPv4
/// header that raw v4 sockets deliver.
fn parse_echo_reply(buf: &[u8], v6: bool, raw: bool) -> Option<(u16, u16)> {
    let offset = if !v6 && raw && buf.first()? >> 4 == 4 {
        ((buf[0] & 0x0f) as usize) * 4
    } else {
        0
    };
    let icmp = buf.get(offset..offset + 8)?;
    let reply_type = if v6 { 129 } else { 0 };
    if icmp[0] != reply_type {
        return None;
    }
    Some((
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    ))
}

/// Build an ICMP (type 8) or ICMPv6 (type 128) Echo Request with `payload_size`
/// payload bytes.
fn build_echo_request(v6: bool, identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + payload_size];

    packet[0] = if v6 { 128 } else { 8 }; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // Fill payload with timestamp, then a repeating pattern
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    if payload_size >= 8 {
        packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
    }
    for (i, b) in packet.iter_mut().enumerate().skip(16) {
        *b = (i & 0xff) as u8;
    }

    // ICMPv6 checksum is computed by the kernel
    if !v6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via command execution (fallback).
async fn run_ping_command(
    address: &str,
    payload_size: usize,
    count: u16,
    timeout: Duration,
) -> Result<PingStats, ProbeError> {
    let wait_secs = (timeout.as_secs() / count.max(1) as u64).max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-s",
            &payload_size.to_string(),
            "-W",
            &wait_secs.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    // Non-zero exit with full loss still prints a summary.
    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ping_summary(&stdout) {
        Some(stats) => Ok(stats),
        None if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("unknown host") || stderr.contains("Name or service not known") {
                return Err(ProbeError::Resolve(stderr.trim().to_string()));
            }
            Err(ProbeError::Command(format!("ping failed: {}", stderr.trim())))
        }
        None => Err(ProbeError::Command(format!(
            "failed to parse ping output: {}",
            stdout
        ))),
    }
}

/// Parse the statistics footer of Linux/BSD/macOS `ping`.
fn parse_ping_summary(output: &str) -> Option<PingStats> {
    // "4 packets transmitted, 3 received" (Linux) or "3 packets received" (macOS)
    static COUNTS: OnceLock<Regex> = OnceLock::new();
    let counts = COUNTS.get_or_init(|| {
        Regex::new(r"(?P<sent>\d+) packets transmitted, (?P<recv>\d+) (?:packets )?received")
            .unwrap()
    });

    // "rtt min/avg/max/mdev = ..." (Linux), "round-trip min/avg/max/stddev = ..." (macOS)
    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt = RTT.get_or_init(|| {
        Regex::new(
            r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)",
        )
        .unwrap()
    });

    let caps = counts.captures(output)?;
    let sent: u16 = caps["sent"].parse().ok()?;
    let received: u16 = caps["recv"].parse().ok()?;

    let mut stats = PingStats {
        sent,
        received,
        ..Default::default()
    };
    if let Some(caps) = rtt.captures(output) {
        stats.min = caps[1].parse().ok()?;
        stats.avg = caps[2].parse().ok()?;
        stats.max = caps[3].parse().ok()?;
    }
    Some(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum() {
        // A packet carrying its own checksum sums to zero.
        let packet = build_echo_request(false, 0x1234, 0x0001, 56);
        assert_eq!(icmp_checksum(&packet), 0);
        assert_ne!(icmp_checksum(&[8, 0, 0, 0, 0x12, 0x34, 0, 1]), 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_echo_request(false, 0x1234, 0x0001, 56);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8); // Type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(packet[4..6], [0x12, 0x34]); // ID
        assert_eq!(packet[6..8], [0x00, 0x01]); // Sequence

        let v6 = build_echo_request(true, 1, 2, 100);
        assert_eq!(v6.len(), 108);
        assert_eq!(v6[0], 128);
    }

    #[test]
    fn test_parse_echo_reply_with_ip_header() {
        let mut raw = vec![0x45u8];
        raw.extend_from_slice(&[0u8; 19]);
        raw.extend_from_slice(&[0, 0, 0, 0, 0x12, 0x34, 0, 7]);
        assert_eq!(parse_echo_reply(&raw, false, true), Some((0x1234, 7)));

        // DGRAM sockets deliver the bare ICMP message.
        let dgram = [0u8, 0, 0, 0, 0xab, 0xcd, 0, 9];
        assert_eq!(parse_echo_reply(&dgram, false, false), Some((0xabcd, 9)));

        // Echo request (type 8) is not a reply.
        let request = [8u8, 0, 0, 0, 0, 1, 0, 1];
        assert_eq!(parse_echo_reply(&request, false, false), None);
        assert_eq!(parse_echo_reply(&[0, 0], false, false), None);
    }

    #[test]
    fn test_parse_linux_summary() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms

--- 8.8.8.8 ping statistics ---
4 packets transmitted, 3 received, 25% packet loss, time 3004ms
rtt min/avg/max/mdev = 11.100/12.300/14.500/0.900 ms"#;
        let stats = parse_ping_summary(output).unwrap();
        assert_eq!((stats.sent, stats.received), (4, 3));
        assert_eq!(stats.min, 11.1);
        assert_eq!(stats.avg, 12.3);
        assert_eq!(stats.max, 14.5);
        assert_eq!(stats.loss_percent(), 25.0);
    }

    #[test]
    fn test_parse_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let stats = parse_ping_summary(output).unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.avg, 17.906);
    }

    #[test]
    fn test_parse_total_loss_summary() {
        let output = "--- 10.255.255.1 ping statistics ---\n\
                      2 packets transmitted, 0 received, 100% packet loss, time 1016ms\n";
        let stats = parse_ping_summary(output).unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.loss_percent(), 100.0);
    }

    #[test]
    fn test_stats_from_samples() {
        let stats = PingStats::from_samples(3, &[2.0, 4.0]);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.avg, 3.0);
        assert_eq!(stats.loss_percent(), 33.33);
    }

    #[test]
    fn test_loss_classification() {
        let driver = PingDriver::new(50.0);
        let timeout = Duration::from_secs(2);

        let clean = driver.outcome(PingStats::from_samples(4, &[1.0; 4]), timeout).unwrap();
        assert!(clean.success && !clean.degraded);
        assert_eq!(clean.timings.packet_loss_percent, Some(0.0));

        let partial = driver.outcome(PingStats::from_samples(4, &[1.0; 3]), timeout).unwrap();
        assert!(partial.success && partial.degraded);

        let heavy = driver.outcome(PingStats::from_samples(4, &[1.0; 2]), timeout).unwrap();
        assert!(!heavy.success);

        let none = driver.outcome(PingStats::from_samples(4, &[]), timeout);
        assert!(matches!(none, Err(ProbeError::Timeout(_))));
    }
}
