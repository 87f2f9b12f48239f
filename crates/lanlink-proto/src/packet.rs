//! Minimal Ethernet, ARP and IPv4 handling for routed devices

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write;
use std::net::Ipv4Addr;

pub type HwAddr = [u8; 6];

pub const BROADCAST_HW: HwAddr = [0xff; 6];
pub const ZERO_HW: HwAddr = [0u8; 6];

pub const ETHERNET_HEADER_SIZE: usize = 14;
pub const ETH_P_IP4: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;

pub const ARP_PACKET_SIZE: usize = 28;
const ARP_HW_ETHERNET: u16 = 1;

const IPV4_MIN_HEADER: usize = 20;

/// Random locally administered unicast address
pub fn random_hw_addr() -> HwAddr {
    let mut addr: HwAddr = rand::random();
    addr[0] = (addr[0] & 0xfe) | 0x02;
    addr
}

pub fn format_hw_addr(addr: &HwAddr) -> String {
    let mut out = String::with_capacity(17);
    for (i, byte) in addr.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: HwAddr,
    pub src: HwAddr,
    pub ether_type: u16,
}

impl EthernetHeader {
    pub fn new(dst: HwAddr, src: HwAddr, ether_type: u16) -> Self {
        Self {
            dst,
            src,
            ether_type,
        }
    }

    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETHERNET_HEADER_SIZE {
            return None;
        }
        let mut dst = ZERO_HW;
        let mut src = ZERO_HW;
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        Some(Self {
            dst,
            src,
            ether_type: u16::from_be_bytes([frame[12], frame[13]]),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.dst);
        buf.put_slice(&self.src);
        buf.put_u16(self.ether_type);
    }

    /// Prepend this header to `payload`
    pub fn wrap(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(ETHERNET_HEADER_SIZE + payload.len());
        self.encode(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ArpOperation {
    Request = 1,
    Reply = 2,
}

impl TryFrom<u16> for ArpOperation {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ArpOperation::Request),
            2 => Ok(ArpOperation::Reply),
            other => Err(other),
        }
    }
}

/// IPv4-over-Ethernet ARP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub sender_hw: HwAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: HwAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_hw: HwAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOperation::Request,
            sender_hw,
            sender_ip,
            target_hw: ZERO_HW,
            target_ip,
        }
    }

    /// Reply answering this request on behalf of `hw`
    pub fn reply(&self, hw: HwAddr) -> Self {
        Self {
            operation: ArpOperation::Reply,
            sender_hw: hw,
            sender_ip: self.target_ip,
            target_hw: self.sender_hw,
            target_ip: self.sender_ip,
        }
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_PACKET_SIZE {
            return None;
        }
        let hw_type = u16::from_be_bytes([data[0], data[1]]);
        let proto_type = u16::from_be_bytes([data[2], data[3]]);
        if hw_type != ARP_HW_ETHERNET || proto_type != ETH_P_IP4 || data[4] != 6 || data[5] != 4 {
            return None;
        }
        let operation = ArpOperation::try_from(u16::from_be_bytes([data[6], data[7]])).ok()?;

        let mut sender_hw = ZERO_HW;
        let mut target_hw = ZERO_HW;
        sender_hw.copy_from_slice(&data[8..14]);
        target_hw.copy_from_slice(&data[18..24]);
        Some(Self {
            operation,
            sender_hw,
            sender_ip: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            target_hw,
            target_ip: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(ARP_HW_ETHERNET);
        buf.put_u16(ETH_P_IP4);
        buf.put_u8(6);
        buf.put_u8(4);
        buf.put_u16(self.operation as u16);
        buf.put_slice(&self.sender_hw);
        buf.put_slice(&self.sender_ip.octets());
        buf.put_slice(&self.target_hw);
        buf.put_slice(&self.target_ip.octets());
    }

    /// Full Ethernet frame carrying this packet
    pub fn to_frame(&self, dst: HwAddr) -> Bytes {
        let mut buf = BytesMut::with_capacity(ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE);
        EthernetHeader::new(dst, self.sender_hw, ETH_P_ARP).encode(&mut buf);
        self.encode(&mut buf);
        buf.freeze()
    }

    /// ARP packet inside an Ethernet frame, if that is what it carries
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        let header = EthernetHeader::decode(frame)?;
        if header.ether_type != ETH_P_ARP {
            return None;
        }
        Self::decode(&frame[ETHERNET_HEADER_SIZE..])
    }
}

/// Destination of an IPv4 packet
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW_A: HwAddr = [0x02, 0, 0, 0, 0, 0x0a];
    const HW_B: HwAddr = [0x02, 0, 0, 0, 0, 0x0b];

    #[test]
    fn test_arp_request_reply() {
        let request = ArpPacket::request(
            HW_A,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 1),
        );
        let frame = request.to_frame(BROADCAST_HW);
        assert_eq!(frame.len(), ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE);

        let header = EthernetHeader::decode(&frame).unwrap();
        assert_eq!(header.dst, BROADCAST_HW);
        assert_eq!(header.ether_type, ETH_P_ARP);

        let decoded = ArpPacket::from_frame(&frame).unwrap();
        assert_eq!(decoded, request);

        let reply = decoded.reply(HW_B);
        assert_eq!(reply.operation, ArpOperation::Reply);
        assert_eq!(reply.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(reply.target_hw, HW_A);
        assert_eq!(reply.target_ip, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_non_arp_frame() {
        let frame = EthernetHeader::new(HW_A, HW_B, ETH_P_IP4).wrap(&[0x45; 20]);
        assert!(ArpPacket::from_frame(&frame).is_none());
    }

    #[test]
    fn test_ipv4_destination() {
        let mut packet = [0u8; 20];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&[192, 168, 1, 9]);
        assert_eq!(
            ipv4_destination(&packet),
            Some(Ipv4Addr::new(192, 168, 1, 9))
        );

        packet[0] = 0x60;
        assert_eq!(ipv4_destination(&packet), None);
        assert_eq!(ipv4_destination(&[0x45; 10]), None);
    }

    #[test]
    fn test_random_hw_addr_is_local_unicast() {
        let addr = random_hw_addr();
        assert_eq!(addr[0] & 0x01, 0);
        assert_eq!(addr[0] & 0x02, 0x02);
        assert_eq!(format_hw_addr(&HW_A), "02:00:00:00:00:0a");
    }
}
