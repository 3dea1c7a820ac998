//! DNS probe implementation using raw UDP packets.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::net::UdpSocket;

use super::{ms, resolve_host, Deadline, ProbeDriver, ProbeError, ProbeMeta, ProbeOutcome};
use crate::check::{CheckDefinition, CheckKind, CheckTarget, DnsRecordType};
use crate::db::Timings;

pub struct DnsDriver;

/// One decoded answer record.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsAnswer {
    pub rtype: u16,
    pub ttl: u32,
    pub data: String,
}

#[async_trait]
impl ProbeDriver for DnsDriver {
    fn kind(&self) -> CheckKind {
        CheckKind::Dns
    }

    async fn execute(
        &self,
        def: &CheckDefinition,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let CheckTarget::Dns(target) = &def.target else {
            return Err(ProbeError::Config(format!("check {} is not a dns check", def.id)));
        };

        let deadline = Deadline::new(timeout);
        let server = resolve_host(&target.resolver, target.port, &deadline).await?;
        let qname = query_name(&target.ip, target.record_type);
        let (packet, tx_id) = build_dns_query(&qname, target.record_type.qtype())?;

        let bind_addr = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
        socket
            .connect(server)
            .await
            .map_err(|e| ProbeError::from_io(e, timeout))?;

        let sent_at = deadline.elapsed();
        socket
            .send(&packet)
            .await
            .map_err(|e| ProbeError::from_io(e, timeout))?;

        // Ignore stray datagrams until ours arrives.
        let response = deadline
            .run(async {
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket
                        .recv(&mut buf)
                        .await
                        .map_err(|e| ProbeError::from_io(e, timeout))?;
                    if n >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == tx_id {
                        return Ok(buf[..n].to_vec());
                    }
                }
            })
            .await?;
        let elapsed = deadline.elapsed() - sent_at;

        let answers = parse_dns_response(&response, tx_id)?;
        let timings = Timings {
            response_time: Some(ms(elapsed)),
            ..Default::default()
        };

        let wanted = target.record_type.qtype();
        let matching: Vec<String> = answers
            .iter()
            .filter(|a| a.rtype == wanted)
            .map(|a| a.data.clone())
            .collect();

        if matching.is_empty() {
            return Ok(ProbeOutcome::failed(
                timings,
                format!("no {:?} record for {}", target.record_type, qname),
            ));
        }

        let mut outcome = ProbeOutcome::ok(timings);
        outcome.meta = ProbeMeta {
            answers: matching,
            ..Default::default()
        };
        Ok(outcome)
    }
}

/// PTR lookups on an address query the reverse zone.
fn query_name(name: &str, record_type: DnsRecordType) -> String {
    let name = name.trim().trim_end_matches('.');
    if record_type != DnsRecordType::Ptr {
        return name.to_string();
    }
    match name.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        Ok(IpAddr::V6(v6)) => {
            let mut labels: Vec<String> = v6
                .octets()
                .iter()
                .flat_map(|b| [b >> 4, b & 0x0f])
                .map(|n| format!("{:x}", n))
                .collect();
            labels.reverse();
            format!("{}.ip6.arpa", labels.join("."))
        }
        Err(_) => name.to_string(),
    }
}

/// Build a recursive query for `name` with the given QTYPE.
fn build_dns_query(name: &str, qtype: u16) -> Result<(Vec<u8>, u16), ProbeError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired
    let qd_count: u16 = 1;

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&qd_count.to_be_bytes());
    packet.extend_from_slice(&[0u8; 6]); // AN, NS, AR counts

    // Question: length-prefixed labels
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            return Err(ProbeError::Config(format!("label {:?} is longer than 63 bytes", label)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0); // Null terminator

    packet.extend_from_slice(&qtype.to_be_bytes());
    // QCLASS: IN (1)
    packet.extend_from_slice(&1u16.to_be_bytes());

    Ok((packet, tx_id))
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, ProbeError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| truncated())
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, ProbeError> {
    buf.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| truncated())
}

fn truncated() -> ProbeError {
    ProbeError::Protocol("truncated DNS response".to_string())
}

/// Decode a possibly compressed name at `pos`; returns the name and the
/// position just past it in the original stream.
fn read_name(buf: &[u8], mut pos: usize) -> Result<(String, usize), ProbeError> {
    let mut labels = Vec::new();
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(pos).ok_or_else(truncated)?;
        match len {
            0 => {
                pos += 1;
                break;
            }
            l if l & 0xc0 == 0xc0 => {
                let ptr = (read_u16(buf, pos)? & 0x3fff) as usize;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                jumps += 1;
                if jumps > 32 {
                    return Err(ProbeError::Protocol("DNS name compression loop".to_string()));
                }
                pos = ptr;
            }
            l => {
                let l = l as usize;
                let label = buf.get(pos + 1..pos + 1 + l).ok_or_else(truncated)?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + l;
            }
        }
    }
    Ok((labels.join("."), end.unwrap_or(pos)))
}

fn render_rdata(buf: &[u8], rtype: u16, start: usize, rdata: &[u8]) -> Result<String, ProbeError> {
    let text = match rtype {
        1 if rdata.len() == 4 => Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string(),
        28 if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Ipv6Addr::from(octets).to_string()
        }
        2 | 5 | 12 => read_name(buf, start)?.0,
        15 => {
            let pref = read_u16(buf, start)?;
            format!("{} {}", pref, read_name(buf, start + 2)?.0)
        }
        6 => {
            let (mname, next) = read_name(buf, start)?;
            let (rname, next) = read_name(buf, next)?;
            format!("{} {} {}", mname, rname, read_u32(buf, next)?)
        }
        16 => {
            let mut parts = Vec::new();
            let mut i = 0;
            while i < rdata.len() {
                let l = rdata[i] as usize;
                let chunk = rdata.get(i + 1..i + 1 + l).ok_or_else(truncated)?;
                parts.push(String::from_utf8_lossy(chunk).into_owned());
                i += 1 + l;
            }
            parts.join("")
        }
        33 => {
            let priority = read_u16(buf, start)?;
            let weight = read_u16(buf, start + 2)?;
            let port = read_u16(buf, start + 4)?;
            format!("{} {} {} {}", priority, weight, port, read_name(buf, start + 6)?.0)
        }
        257 if rdata.len() >= 2 => {
            let flags = rdata[0];
            let tag_len = rdata[1] as usize;
            let tag = rdata.get(2..2 + tag_len).ok_or_else(truncated)?;
            let value = &rdata[2 + tag_len..];
            format!(
                "{} {} \"{}\"",
                flags,
                String::from_utf8_lossy(tag),
                String::from_utf8_lossy(value)
            )
        }
        _ => rdata.iter().map(|b| format!("{:02x}", b)).collect(),
    };
    Ok(text)
}

/// Validate a response and decode its answer section.
fn parse_dns_response(buf: &[u8], tx_id: u16) -> Result<Vec<DnsAnswer>, ProbeError> {
    if buf.len() < 12 {
        return Err(ProbeError::Protocol(format!(
            "response too short: {} bytes",
            buf.len()
        )));
    }

    let resp_tx_id = read_u16(buf, 0)?;
    if resp_tx_id != tx_id {
        return Err(ProbeError::Protocol(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }
    if buf[2] & 0x80 == 0 {
        return Err(ProbeError::Protocol("reply is not a response".to_string()));
    }

    // Check RCODE (lower 4 bits of byte 3)
    let rcode = buf[3] & 0x0F;
    if rcode != 0 {
        let name = match rcode {
            1 => "FORMERR",
            2 => "SERVFAIL",
            3 => "NXDOMAIN",
            4 => "NOTIMP",
            5 => "REFUSED",
            _ => "error",
        };
        return Err(ProbeError::Protocol(format!("DNS {} (RCODE {})", name, rcode)));
    }

    let qd_count = read_u16(buf, 4)?;
    let an_count = read_u16(buf, 6)?;

    let mut pos = 12;
    for _ in 0..qd_count {
        let (_, next) = read_name(buf, pos)?;
        pos = next + 4;
    }

    let mut answers = Vec::with_capacity(an_count as usize);
    for _ in 0..an_count {
        let (_, next) = read_name(buf, pos)?;
        let rtype = read_u16(buf, next)?;
        let ttl = read_u32(buf, next + 4)?;
        let rdlen = read_u16(buf, next + 8)? as usize;
        let start = next + 10;
        let rdata = buf.get(start..start + rdlen).ok_or_else(truncated)?;
        answers.push(DnsAnswer {
            rtype,
            ttl,
            data: render_rdata(buf, rtype, start, rdata)?,
        });
        pos = start + rdlen;
    }
    Ok(answers)
}
