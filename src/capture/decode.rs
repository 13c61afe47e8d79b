// Frame decoding: link, network and transport headers down to a connection key

use crate::error::DecodeSkip;
use crate::model::{ConnectionKey, Direction, Protocol};
use pnet::packet::Packet;
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;

/// How frames are framed on a given interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// No link header, the frame starts with the IP header (tun devices)
    RawIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    /// Any other protocol, or a fragment without a transport header
    Other(u8),
}

impl Transport {
    fn protocol_number(&self) -> u8 {
        match self {
            Transport::Tcp { .. } => IpNextHeaderProtocols::Tcp.0,
            Transport::Udp { .. } => IpNextHeaderProtocols::Udp.0,
            Transport::Other(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram {
    V4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        transport: Transport,
    },
    V6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        transport: Transport,
    },
}

/// The parts of a captured frame needed for attribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame {
    pub datagram: Datagram,
    /// Length of the whole captured frame
    pub length: usize,
}

impl DecodedFrame {
    pub fn source(&self) -> IpAddr {
        match self.datagram {
            Datagram::V4 { src, .. } => IpAddr::V4(src),
            Datagram::V6 { src, .. } => IpAddr::V6(src),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self.datagram {
            Datagram::V4 { dst, .. } => IpAddr::V4(dst),
            Datagram::V6 { dst, .. } => IpAddr::V6(dst),
        }
    }

    pub fn transport(&self) -> Transport {
        match self.datagram {
            Datagram::V4 { transport, .. } | Datagram::V6 { transport, .. } => transport,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.datagram, Datagram::V4 { .. })
    }

    /// (source, destination) ports for TCP and UDP
    pub fn ports(&self) -> Option<(u16, u16)> {
        match self.transport() {
            Transport::Tcp { src_port, dst_port } | Transport::Udp { src_port, dst_port } => {
                Some((src_port, dst_port))
            }
            Transport::Other(_) => None,
        }
    }

    pub fn protocol_number(&self) -> u8 {
        self.transport().protocol_number()
    }

    pub fn protocol(&self) -> Protocol {
        match self.transport() {
            Transport::Tcp { .. } => Protocol::Tcp,
            Transport::Udp { .. } => Protocol::Udp,
            Transport::Other(n) => Protocol::Other(n),
        }
    }

    /// Map this frame to its canonical connection key and direction.
    ///
    /// Rules, in order:
    /// - only the source is local: sent, local = source
    /// - only the destination is local: received, local = destination
    /// - both local (loopback, host-to-host): sent from the source, so the
    ///   packet is counted once against the sending socket
    /// - neither local (promiscuous capture): received, local = destination
    pub fn canonicalize(&self, local: &HashSet<IpAddr>) -> (ConnectionKey, Direction) {
        let (src, dst) = (self.source(), self.destination());
        let (src_port, dst_port) = self.ports().unwrap_or((0, 0));
        let protocol = self.protocol();

        if local.contains(&src) {
            (
                ConnectionKey::new(protocol, src, src_port, dst, dst_port),
                Direction::Sent,
            )
        } else {
            (
                ConnectionKey::new(protocol, dst, dst_port, src, src_port),
                Direction::Received,
            )
        }
    }
}

/// Decode a captured frame.
pub fn decode_frame(link: LinkType, frame: &[u8]) -> Result<DecodedFrame, DecodeSkip> {
    let datagram = match link {
        LinkType::Ethernet => decode_ethernet(frame)?,
        LinkType::RawIp => decode_raw_ip(frame)?,
    };
    Ok(DecodedFrame {
        datagram,
        length: frame.len(),
    })
}

fn decode_ethernet(frame: &[u8]) -> Result<Datagram, DecodeSkip> {
    let ethernet = EthernetPacket::new(frame).ok_or(DecodeSkip::Truncated("ethernet"))?;
    let mut ethertype = ethernet.get_ethertype();
    let mut payload = ethernet.payload();

    // One 802.1Q tag
    if ethertype == EtherTypes::Vlan {
        let vlan = VlanPacket::new(payload).ok_or(DecodeSkip::Truncated("802.1Q"))?;
        ethertype = vlan.get_ethertype();
        payload = &payload[VlanPacket::minimum_packet_size()..];
    }

    decode_by_ethertype(ethertype, payload)
}

fn decode_by_ethertype(ethertype: EtherType, payload: &[u8]) -> Result<Datagram, DecodeSkip> {
    match ethertype {
        EtherTypes::Ipv4 => decode_ipv4(payload),
        EtherTypes::Ipv6 => decode_ipv6(payload),
        other => Err(DecodeSkip::UnsupportedEtherType(other.0)),
    }
}

fn decode_raw_ip(frame: &[u8]) -> Result<Datagram, DecodeSkip> {
    let first = frame.first().ok_or(DecodeSkip::Truncated("IP"))?;
    match first >> 4 {
        4 => decode_ipv4(frame),
        6 => decode_ipv6(frame),
        v => Err(DecodeSkip::UnsupportedIpVersion(v)),
    }
}

fn decode_ipv4(bytes: &[u8]) -> Result<Datagram, DecodeSkip> {
    let ipv4 = Ipv4Packet::new(bytes).ok_or(DecodeSkip::Truncated("IPv4"))?;
    if ipv4.get_version() != 4 {
        return Err(DecodeSkip::Malformed("IPv4"));
    }

    let header_len = ipv4.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER || header_len > bytes.len() {
        return Err(DecodeSkip::Malformed("IPv4"));
    }

    let protocol = ipv4.get_next_level_protocol();
    // Only the first fragment carries the transport header
    let transport = if ipv4.get_fragment_offset() != 0 {
        Transport::Other(protocol.0)
    } else {
        decode_transport(protocol, &bytes[header_len..])
    };

    Ok(Datagram::V4 {
        src: ipv4.get_source(),
        dst: ipv4.get_destination(),
        transport,
    })
}

fn decode_ipv6(bytes: &[u8]) -> Result<Datagram, DecodeSkip> {
    let ipv6 = Ipv6Packet::new(bytes).ok_or(DecodeSkip::Truncated("IPv6"))?;
    if ipv6.get_version() != 6 {
        return Err(DecodeSkip::Malformed("IPv6"));
    }

    let mut next = ipv6.get_next_header();
    let mut rest = &bytes[IPV6_HEADER..];
    let mut first_fragment = true;

    // Walk extension headers until a transport header
    loop {
        match next {
            IpNextHeaderProtocols::Hopopt
            | IpNextHeaderProtocols::Ipv6Route
            | IpNextHeaderProtocols::Ipv6Opts => {
                if rest.len() < 8 {
                    return Err(DecodeSkip::Truncated("IPv6 extension"));
                }
                let len = (rest[1] as usize + 1) * 8;
                if rest.len() < len {
                    return Err(DecodeSkip::Truncated("IPv6 extension"));
                }
                next = IpNextHeaderProtocol(rest[0]);
                rest = &rest[len..];
            }
            IpNextHeaderProtocols::Ipv6Frag => {
                if rest.len() < 8 {
                    return Err(DecodeSkip::Truncated("IPv6 fragment"));
                }
                let offset = u16::from_be_bytes([rest[2], rest[3]]) >> 3;
                first_fragment = offset == 0;
                next = IpNextHeaderProtocol(rest[0]);
                rest = &rest[8..];
            }
            _ => break,
        }
    }

    let transport = if first_fragment {
        decode_transport(next, rest)
    } else {
        Transport::Other(next.0)
    };

    Ok(Datagram::V6 {
        src: ipv6.get_source(),
        dst: ipv6.get_destination(),
        transport,
    })
}

/// TCP and UDP give ports; anything else, or a header too short to read,
/// lands in the per-protocol bucket.
fn decode_transport(protocol: IpNextHeaderProtocol, bytes: &[u8]) -> Transport {
    match protocol {
        IpNextHeaderProtocols::Tcp => match TcpPacket::new(bytes) {
            Some(tcp) => Transport::Tcp {
                src_port: tcp.get_source(),
                dst_port: tcp.get_destination(),
            },
            None => Transport::Other(protocol.0),
        },
        IpNextHeaderProtocols::Udp => match UdpPacket::new(bytes) {
            Some(udp) => Transport::Udp {
                src_port: udp.get_source(),
                dst_port: udp.get_destination(),
            },
            None => Transport::Other(protocol.0),
        },
        other => Transport::Other(other.0),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build an Ethernet + IPv4 + UDP frame padded to `total_len` bytes
    pub(crate) fn udp_v4_frame(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        total_len: usize,
    ) -> Vec<u8> {
        ipv4_frame(src, dst, 17, total_len, |l4| {
            l4[0..2].copy_from_slice(&src_port.to_be_bytes());
            l4[2..4].copy_from_slice(&dst_port.to_be_bytes());
            let udp_len = l4.len() as u16;
            l4[4..6].copy_from_slice(&udp_len.to_be_bytes());
        })
    }

    pub(crate) fn tcp_v4_frame(
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        total_len: usize,
    ) -> Vec<u8> {
        ipv4_frame(src, dst, 6, total_len, |l4| {
            l4[0..2].copy_from_slice(&src_port.to_be_bytes());
            l4[2..4].copy_from_slice(&dst_port.to_be_bytes());
            l4[12] = 5 << 4;
        })
    }

    fn ipv4_frame(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        total_len: usize,
        fill_l4: impl FnOnce(&mut [u8]),
    ) -> Vec<u8> {
        let mut frame = vec![0u8; total_len];
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        let ip = &mut frame[14..];
        ip[0] = 0x45;
        let ip_len = ip.len() as u16;
        ip[2..4].copy_from_slice(&ip_len.to_be_bytes());
        ip[8] = 64;
        ip[9] = protocol;
        ip[12..16].copy_from_slice(&src.octets());
        ip[16..20].copy_from_slice(&dst.octets());
        fill_l4(&mut ip[20..]);
        frame
    }

    fn tcp_v6_frame_with_hop_by_hop(src: Ipv6Addr, dst: Ipv6Addr, sport: u16, dport: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 14 + 40 + 8 + 20];
        frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
        let ip = &mut frame[14..];
        ip[0] = 0x60;
        ip[4..6].copy_from_slice(&28u16.to_be_bytes());
        ip[6] = 0; // hop-by-hop
        ip[7] = 64;
        ip[8..24].copy_from_slice(&src.octets());
        ip[24..40].copy_from_slice(&dst.octets());
        ip[40] = 6; // next: tcp
        ip[41] = 0; // 8 bytes
        ip[48..50].copy_from_slice(&sport.to_be_bytes());
        ip[50..52].copy_from_slice(&dport.to_be_bytes());
        ip[60] = 5 << 4;
        frame
    }

    fn local(addrs: &[&str]) -> HashSet<IpAddr> {
        addrs.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_decode_udp_v4() {
        let frame = udp_v4_frame(
            Ipv4Addr::new(10, 0, 0, 2),
            5000,
            Ipv4Addr::new(10, 0, 0, 1),
            80,
            60,
        );
        let decoded = decode_frame(LinkType::Ethernet, &frame).unwrap();
        assert_eq!(decoded.length, 60);
        assert_eq!(decoded.protocol(), Protocol::Udp);
        assert_eq!(decoded.ports(), Some((5000, 80)));
        assert_eq!(decoded.source(), "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_inbound_udp_canonical_key() {
        let frame = udp_v4_frame(
            Ipv4Addr::new(10, 0, 0, 2),
            5000,
            Ipv4Addr::new(10, 0, 0, 1),
            80,
            60,
        );
        let decoded = decode_frame(LinkType::Ethernet, &frame).unwrap();
        let (key, direction) = decoded.canonicalize(&local(&["10.0.0.1"]));

        assert_eq!(direction, Direction::Received);
        assert_eq!(
            key,
            ConnectionKey::new(
                Protocol::Udp,
                "10.0.0.1".parse().unwrap(),
                80,
                "10.0.0.2".parse().unwrap(),
                5000
            )
        );
    }

    #[test]
    fn test_both_directions_share_a_key() {
        let out = tcp_v4_frame(
            Ipv4Addr::new(192, 168, 1, 10),
            40000,
            Ipv4Addr::new(93, 184, 216, 34),
            443,
            74,
        );
        let back = tcp_v4_frame(
            Ipv4Addr::new(93, 184, 216, 34),
            443,
            Ipv4Addr::new(192, 168, 1, 10),
            40000,
            1514,
        );
        let local = local(&["192.168.1.10"]);

        let (out_key, out_dir) = decode_frame(LinkType::Ethernet, &out)
            .unwrap()
            .canonicalize(&local);
        let (back_key, back_dir) = decode_frame(LinkType::Ethernet, &back)
            .unwrap()
            .canonicalize(&local);

        assert_eq!(out_key, back_key);
        assert_eq!(out_dir, Direction::Sent);
        assert_eq!(back_dir, Direction::Received);
    }

    #[test]
    fn test_loopback_attributed_to_sender() {
        let local = local(&["127.0.0.1"]);
        let request = tcp_v4_frame(Ipv4Addr::LOCALHOST, 51000, Ipv4Addr::LOCALHOST, 8080, 80);
        let reply = tcp_v4_frame(Ipv4Addr::LOCALHOST, 8080, Ipv4Addr::LOCALHOST, 51000, 80);

        let (req_key, req_dir) = decode_frame(LinkType::Ethernet, &request)
            .unwrap()
            .canonicalize(&local);
        let (rep_key, rep_dir) = decode_frame(LinkType::Ethernet, &reply)
            .unwrap()
            .canonicalize(&local);

        // Each side of a loopback conversation is charged to its own socket
        assert_eq!(req_dir, Direction::Sent);
        assert_eq!(rep_dir, Direction::Sent);
        assert_eq!(req_key.local_port, 51000);
        assert_eq!(req_key.remote_port, 8080);
        assert_eq!(rep_key.local_port, 8080);
        assert_eq!(rep_key.remote_port, 51000);
    }

    #[test]
    fn test_foreign_traffic_treated_as_received() {
        let frame = udp_v4_frame(
            Ipv4Addr::new(10, 9, 9, 1),
            1,
            Ipv4Addr::new(10, 9, 9, 2),
            2,
            60,
        );
        let (key, dir) = decode_frame(LinkType::Ethernet, &frame)
            .unwrap()
            .canonicalize(&local(&["10.0.0.1"]));
        assert_eq!(dir, Direction::Received);
        assert_eq!(key.local_addr, "10.9.9.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_ipv6_extension_headers_walked() {
        let src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let frame = tcp_v6_frame_with_hop_by_hop(src, dst, 443, 50000);

        let decoded = decode_frame(LinkType::Ethernet, &frame).unwrap();
        assert!(!decoded.is_ipv4());
        assert_eq!(decoded.protocol(), Protocol::Tcp);
        assert_eq!(decoded.ports(), Some((443, 50000)));
    }

    #[test]
    fn test_raw_ip_link() {
        let frame = udp_v4_frame(
            Ipv4Addr::new(10, 0, 0, 2),
            5000,
            Ipv4Addr::new(10, 0, 0, 1),
            80,
            60,
        );
        let decoded = decode_frame(LinkType::RawIp, &frame[14..]).unwrap();
        assert_eq!(decoded.length, 46);
        assert_eq!(decoded.ports(), Some((5000, 80)));
    }

    #[test]
    fn test_icmp_goes_to_other_bucket() {
        let frame = ipv4_frame(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
            1,
            98,
            |_| {},
        );
        let decoded = decode_frame(LinkType::Ethernet, &frame).unwrap();
        let (key, _) = decoded.canonicalize(&local(&["10.0.0.1"]));
        assert_eq!(key.protocol, Protocol::Other(1));
        assert_eq!((key.local_port, key.remote_port), (0, 0));
    }

    #[test]
    fn test_malformed_frames_are_skipped() {
        assert_eq!(
            decode_frame(LinkType::Ethernet, &[0u8; 6]),
            Err(DecodeSkip::Truncated("ethernet"))
        );

        let mut arp = vec![0u8; 60];
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(
            decode_frame(LinkType::Ethernet, &arp),
            Err(DecodeSkip::UnsupportedEtherType(0x0806))
        );

        // IHL of 2 words is shorter than the fixed header
        let mut bad_ihl = udp_v4_frame(
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            Ipv4Addr::new(10, 0, 0, 1),
            2,
            60,
        );
        bad_ihl[14] = 0x42;
        assert_eq!(
            decode_frame(LinkType::Ethernet, &bad_ihl),
            Err(DecodeSkip::Malformed("IPv4"))
        );

        assert_eq!(
            decode_frame(LinkType::RawIp, &[0x20, 0, 0]),
            Err(DecodeSkip::UnsupportedIpVersion(2))
        );
    }
}
