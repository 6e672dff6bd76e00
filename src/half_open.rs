use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, warn};
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpFlags, TcpOption, TcpPacket};
use pnet::packet::Packet;
use pnet::transport::{self, transport_channel, TransportChannelType};
use rand::{thread_rng, Rng};
use tokio::sync::mpsc;

use crate::models::PortState;
use crate::timing::ProbeRateLimiter;

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const ICMP_ECHO_LEN: usize = 16;

/// Poll granularity of the blocking receive loop.
const RECV_POLL: Duration = Duration::from_millis(100);

/// One classified reply from the SYN batch.
#[derive(Debug, Clone, Copy)]
pub struct SynReply {
    pub state: PortState,
    pub ttl: u8,
    pub window: u16,
    pub latency: Duration,
}

struct RawReply {
    port: u16,
    flags: u8,
    ttl: u8,
    window: u16,
    at: Instant,
}

/// SYN-ACK means open, any RST means closed, everything else is noise.
fn classify_flags(flags: u8) -> Option<PortState> {
    let syn_ack = TcpFlags::SYN | TcpFlags::ACK;
    if flags & syn_ack == syn_ack {
        Some(PortState::Open)
    } else if flags & TcpFlags::RST != 0 {
        Some(PortState::Closed)
    } else {
        None
    }
}

/// Ephemeral source port for a probe batch, above well-known collisions.
pub fn random_high_port() -> u16 {
    thread_rng().gen_range(40000..64000)
}

/// A non-loopback local IPv4 address to source raw packets from.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    for iface in pnet_datalink::interfaces() {
        if !iface.is_up() || iface.is_loopback() {
            continue;
        }
        for network in &iface.ips {
            if let IpAddr::V4(v4) = network.ip() {
                return Some(v4);
            }
        }
    }
    None
}

/// Source address appropriate for a target: loopback targets must be probed
/// from loopback, everything else from the primary interface.
pub fn source_for(target: Ipv4Addr) -> Option<Ipv4Addr> {
    if target.is_loopback() {
        Some(Ipv4Addr::LOCALHOST)
    } else {
        local_ipv4()
    }
}

fn fill_ipv4_header(
    buf: &mut [u8],
    source: Ipv4Addr,
    dest: Ipv4Addr,
    total_len: usize,
    protocol: IpNextHeaderProtocol,
) {
    let mut ip_header = MutableIpv4Packet::new(&mut buf[..total_len]).unwrap();
    ip_header.set_version(4);
    ip_header.set_header_length(5);
    ip_header.set_total_length(total_len as u16);
    ip_header.set_ttl(64);
    ip_header.set_next_level_protocol(protocol);
    ip_header.set_source(source);
    ip_header.set_destination(dest);
    ip_header.set_flags(Ipv4Flags::DontFragment);
    ip_header.set_identification(thread_rng().gen());
}

/// Build a full IPv4+TCP packet with the given flags. Returns the packet
/// length written into `buf`.
fn build_tcp_packet(
    buf: &mut [u8],
    source: Ipv4Addr,
    dest: Ipv4Addr,
    source_port: u16,
    dest_port: u16,
    flags: u8,
) -> usize {
    let options = [TcpOption::mss(1460)];
    let tcp_len = TCP_HEADER_LEN + options.len() * 4;
    let total_len = IPV4_HEADER_LEN + tcp_len;
    assert!(buf.len() >= total_len, "packet buffer undersized");

    fill_ipv4_header(buf, source, dest, total_len, IpNextHeaderProtocols::Tcp);

    {
        let mut tcp_header =
            MutableTcpPacket::new(&mut buf[IPV4_HEADER_LEN..total_len]).unwrap();
        tcp_header.set_source(source_port);
        tcp_header.set_destination(dest_port);
        tcp_header.set_sequence(thread_rng().gen());
        tcp_header.set_acknowledgement(0);
        tcp_header.set_data_offset((tcp_len / 4) as u8);
        tcp_header.set_flags(flags);
        tcp_header.set_window(1024);
        tcp_header.set_urgent_ptr(0);
        tcp_header.set_checksum(0);
        tcp_header.set_options(&options);
        let checksum = tcp::ipv4_checksum(&tcp_header.to_immutable(), &source, &dest);
        tcp_header.set_checksum(checksum);
    }

    // IP checksum covers only the header but goes in last anyway.
    {
        let mut ip_header = MutableIpv4Packet::new(&mut buf[..total_len]).unwrap();
        let checksum = ipv4::checksum(&ip_header.to_immutable());
        ip_header.set_checksum(checksum);
    }

    total_len
}

fn build_icmp_echo(buf: &mut [u8], source: Ipv4Addr, dest: Ipv4Addr, ident: u16) -> usize {
    let total_len = IPV4_HEADER_LEN + ICMP_ECHO_LEN;
    assert!(buf.len() >= total_len, "packet buffer undersized");

    fill_ipv4_header(buf, source, dest, total_len, IpNextHeaderProtocols::Icmp);

    {
        let mut echo =
            MutableEchoRequestPacket::new(&mut buf[IPV4_HEADER_LEN..total_len]).unwrap();
        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_identifier(ident);
        echo.set_sequence_number(1);
        echo.set_payload(b"probedat");
    }
    {
        let view = IcmpPacket::new(&buf[IPV4_HEADER_LEN..total_len]).unwrap();
        let checksum = icmp::checksum(&view);
        let mut echo =
            MutableEchoRequestPacket::new(&mut buf[IPV4_HEADER_LEN..total_len]).unwrap();
        echo.set_checksum(checksum);
    }
    {
        let mut ip_header = MutableIpv4Packet::new(&mut buf[..total_len]).unwrap();
        let checksum = ipv4::checksum(&ip_header.to_immutable());
        ip_header.set_checksum(checksum);
    }

    total_len
}

/// Fire one SYN per port from a single ephemeral source port, then collect
/// replies for `window`. Ports absent from the returned map got no reply
/// and are filtered from the caller's point of view.
///
/// Errors here mean the raw channel itself is unusable (no privilege, no
/// such protocol); the caller treats that as engine unavailability, not as
/// a scan failure.
pub async fn syn_batch(
    source: Ipv4Addr,
    target: Ipv4Addr,
    ports: &[u16],
    window: Duration,
    limiter: &ProbeRateLimiter,
) -> Result<HashMap<u16, SynReply>> {
    let channel_type = TransportChannelType::Layer3(IpNextHeaderProtocols::Tcp);
    let (mut tx, mut rx) = transport_channel(4096, channel_type)
        .map_err(|e| anyhow!("Raw socket channel unavailable: {}", e))?;

    let source_port = random_high_port();
    let stop = Arc::new(AtomicBool::new(false));
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<RawReply>();

    // Receiver runs on a blocking thread: pnet iterators have no async
    // API. It demultiplexes on our single source port and copies out the
    // few fields needed before the packet buffer is reused.
    let recv_stop = Arc::clone(&stop);
    let receiver = tokio::task::spawn_blocking(move || {
        let mut iter = transport::ipv4_packet_iter(&mut rx);
        while !recv_stop.load(Ordering::Relaxed) {
            match iter.next_with_timeout(RECV_POLL) {
                Ok(Some((ip_packet, addr))) => {
                    if addr != IpAddr::V4(target) {
                        continue;
                    }
                    if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                        continue;
                    }
                    let Some(tcp_packet) = TcpPacket::new(ip_packet.payload()) else {
                        continue;
                    };
                    if tcp_packet.get_destination() != source_port {
                        continue;
                    }
                    let reply = RawReply {
                        port: tcp_packet.get_source(),
                        flags: tcp_packet.get_flags(),
                        ttl: ip_packet.get_ttl(),
                        window: tcp_packet.get_window(),
                        at: Instant::now(),
                    };
                    if reply_tx.send(reply).is_err() {
                        break;
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!("[SYN:{}] Receive error: {}", target, e);
                    continue;
                }
            }
        }
    });

    // Send phase. Per-port send failures are isolated; only channel setup
    // failure aborts the batch.
    let mut sent_at: HashMap<u16, Instant> = HashMap::with_capacity(ports.len());
    let mut packet_buf = [0u8; 64];
    for &port in ports {
        limiter.acquire().await;
        let len = build_tcp_packet(
            &mut packet_buf,
            source,
            target,
            source_port,
            port,
            TcpFlags::SYN,
        );
        match Ipv4Packet::new(&packet_buf[..len]) {
            Some(packet) => {
                if let Err(e) = tx.send_to(packet, IpAddr::V4(target)) {
                    warn!("[SYN:{}:{}] Send failed: {}", target, port, e);
                    continue;
                }
                sent_at.insert(port, Instant::now());
            }
            None => continue,
        }
    }
    debug!(
        "[SYN:{}] Sent {} probes from port {}",
        target,
        sent_at.len(),
        source_port
    );

    // Collection phase: one shared window for the whole batch.
    let mut outcomes: HashMap<u16, SynReply> = HashMap::new();
    let deadline = tokio::time::Instant::now() + window;
    while outcomes.len() < sent_at.len() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Ok(Some(reply)) = tokio::time::timeout(remaining, reply_rx.recv()).await else {
            break;
        };
        let Some(&sent) = sent_at.get(&reply.port) else {
            continue;
        };
        let Some(state) = classify_flags(reply.flags) else {
            continue;
        };
        if state == PortState::Open {
            // Reset the embryonic connection so the peer does not hold a
            // half-open slot for us.
            let len = build_tcp_packet(
                &mut packet_buf,
                source,
                target,
                source_port,
                reply.port,
                TcpFlags::RST,
            );
            if let Some(packet) = Ipv4Packet::new(&packet_buf[..len]) {
                if let Err(e) = tx.send_to(packet, IpAddr::V4(target)) {
                    debug!("[SYN:{}:{}] RST send failed: {}", target, reply.port, e);
                }
            }
        }
        outcomes.entry(reply.port).or_insert(SynReply {
            state,
            ttl: reply.ttl,
            window: reply.window,
            latency: reply.at.duration_since(sent),
        });
    }

    stop.store(true, Ordering::Relaxed);
    let _ = receiver.await;
    Ok(outcomes)
}

/// Single ICMP echo to sample the target's TTL for OS inference. `None` on
/// no reply or no privilege; TTL evidence is optional everywhere it is
/// used.
pub async fn icmp_ttl_probe(target: Ipv4Addr, window: Duration) -> Option<u8> {
    let source = source_for(target)?;
    let channel_type = TransportChannelType::Layer3(IpNextHeaderProtocols::Icmp);
    let (mut tx, mut rx) = match transport_channel(4096, channel_type) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("[ICMP:{}] Channel unavailable: {}", target, e);
            return None;
        }
    };

    let ident: u16 = thread_rng().gen();
    let mut buf = [0u8; 64];
    let len = build_icmp_echo(&mut buf, source, target, ident);
    let packet = Ipv4Packet::new(&buf[..len])?;
    if let Err(e) = tx.send_to(packet, IpAddr::V4(target)) {
        debug!("[ICMP:{}] Send failed: {}", target, e);
        return None;
    }

    let ttl = tokio::task::spawn_blocking(move || {
        let mut iter = transport::ipv4_packet_iter(&mut rx);
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            match iter.next_with_timeout(RECV_POLL) {
                Ok(Some((ip_packet, addr))) => {
                    if addr != IpAddr::V4(target) {
                        continue;
                    }
                    if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
                        continue;
                    }
                    let is_reply = IcmpPacket::new(ip_packet.payload())
                        .map_or(false, |p| p.get_icmp_type() == IcmpTypes::EchoReply);
                    if is_reply {
                        return Some(ip_packet.get_ttl());
                    }
                }
                Ok(None) => continue,
                Err(_) => continue,
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    if let Some(ttl) = ttl {
        debug!("[ICMP:{}] Echo reply with TTL {}", target, ttl);
    }
    ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syn_packet_round_trips_through_parsers() {
        let source = Ipv4Addr::new(192, 168, 0, 10);
        let dest = Ipv4Addr::new(192, 168, 0, 20);
        let mut buf = [0u8; 64];
        let len = build_tcp_packet(&mut buf, source, dest, 45000, 443, TcpFlags::SYN);
        assert_eq!(len, IPV4_HEADER_LEN + TCP_HEADER_LEN + 4);

        let ip_packet = Ipv4Packet::new(&buf[..len]).unwrap();
        assert_eq!(ip_packet.get_version(), 4);
        assert_eq!(ip_packet.get_ttl(), 64);
        assert_eq!(ip_packet.get_source(), source);
        assert_eq!(ip_packet.get_destination(), dest);
        assert_eq!(ip_packet.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
        assert_eq!(ip_packet.get_flags(), Ipv4Flags::DontFragment);
        assert_ne!(ip_packet.get_checksum(), 0);

        let tcp_packet = TcpPacket::new(ip_packet.payload()).unwrap();
        assert_eq!(tcp_packet.get_source(), 45000);
        assert_eq!(tcp_packet.get_destination(), 443);
        assert_eq!(tcp_packet.get_flags() & TcpFlags::SYN, TcpFlags::SYN);
        assert_eq!(tcp_packet.get_flags() & TcpFlags::ACK, 0);
        assert_ne!(tcp_packet.get_checksum(), 0);
    }

    #[test]
    fn test_icmp_echo_packet_shape() {
        let source = Ipv4Addr::new(10, 0, 0, 1);
        let dest = Ipv4Addr::new(10, 0, 0, 2);
        let mut buf = [0u8; 64];
        let len = build_icmp_echo(&mut buf, source, dest, 0x1234);
        assert_eq!(len, IPV4_HEADER_LEN + ICMP_ECHO_LEN);

        let ip_packet = Ipv4Packet::new(&buf[..len]).unwrap();
        assert_eq!(
            ip_packet.get_next_level_protocol(),
            IpNextHeaderProtocols::Icmp
        );
        let icmp_packet = IcmpPacket::new(ip_packet.payload()).unwrap();
        assert_eq!(icmp_packet.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_ne!(icmp_packet.get_checksum(), 0);
    }

    #[test]
    fn test_flag_classification() {
        assert_eq!(
            classify_flags(TcpFlags::SYN | TcpFlags::ACK),
            Some(PortState::Open)
        );
        assert_eq!(
            classify_flags(TcpFlags::RST | TcpFlags::ACK),
            Some(PortState::Closed)
        );
        assert_eq!(classify_flags(TcpFlags::RST), Some(PortState::Closed));
        assert_eq!(classify_flags(TcpFlags::SYN), None);
        assert_eq!(classify_flags(TcpFlags::ACK), None);
        assert_eq!(classify_flags(0), None);
    }

    #[test]
    fn test_random_high_port_range() {
        for _ in 0..200 {
            let port = random_high_port();
            assert!((40000..64000).contains(&port));
        }
    }

    #[test]
    fn test_loopback_sources_from_loopback() {
        assert_eq!(
            source_for(Ipv4Addr::LOCALHOST),
            Some(Ipv4Addr::LOCALHOST)
        );
    }
}
