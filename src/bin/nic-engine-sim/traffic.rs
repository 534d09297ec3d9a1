use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use internet_checksum::Checksum;
use log::trace;
use macaddr::MacAddr6;

use nic_engine::{Fragment, PacketSink};

const ETHERNET_HEADER: usize = 14;
const IPV4_HEADER: usize = 20;
const UDP_HEADER: usize = 8;
pub const MIN_FRAME: usize = 60;

// Builds broadcast UDP over IPv4 frames with a valid header checksum
pub struct FrameBuilder {
    source: MacAddr6,
    sequence: u16,
}

impl FrameBuilder {
    pub fn new(source: MacAddr6) -> Self {
        FrameBuilder {
            source,
            sequence: 0,
        }
    }

    pub fn build(&mut self, length: usize) -> Vec<u8> {
        let length = length.max(MIN_FRAME);
        let mut frame = vec![0u8; length];

        // Ethernet: broadcast destination, our source, IPv4 ethertype
        frame[0..6].copy_from_slice(&[0xFF; 6]);
        frame[6..12].copy_from_slice(self.source.as_bytes());
        frame[12..14].copy_from_slice(&0x0800u16.to_be_bytes());

        let ip_length = (length - ETHERNET_HEADER) as u16;
        let header = &mut frame[ETHERNET_HEADER..ETHERNET_HEADER + IPV4_HEADER];
        header[0] = 0x45; // Version 4, 5 words
        header[2..4].copy_from_slice(&ip_length.to_be_bytes());
        header[4..6].copy_from_slice(&self.sequence.to_be_bytes());
        header[8] = 64; // TTL
        header[9] = 17; // UDP
        header[12..16].copy_from_slice(&[10, 0, 0, 1]);
        header[16..20].copy_from_slice(&[10, 0, 0, 255]);

        let mut checksum = Checksum::new();
        checksum.add_bytes(header);
        header[10..12].copy_from_slice(&checksum.checksum());

        let udp = ETHERNET_HEADER + IPV4_HEADER;
        frame[udp..udp + 2].copy_from_slice(&9u16.to_be_bytes());
        frame[udp + 2..udp + 4].copy_from_slice(&9u16.to_be_bytes());
        frame[udp + 4..udp + 6].copy_from_slice(&(ip_length - IPV4_HEADER as u16).to_be_bytes());

        // Payload pattern derived from the sequence number, easy to spot in dumps
        for (i, byte) in frame[udp + UDP_HEADER..].iter_mut().enumerate() {
            *byte = (i as u16).wrapping_add(self.sequence) as u8;
        }

        self.sequence = self.sequence.wrapping_add(1);
        frame
    }
}

pub fn ipv4_header_valid(frame: &[u8]) -> bool {
    if frame.len() < ETHERNET_HEADER + IPV4_HEADER {
        return false;
    }
    let mut checksum = Checksum::new();
    checksum.add_bytes(&frame[ETHERNET_HEADER..ETHERNET_HEADER + IPV4_HEADER]);
    checksum.checksum() == [0, 0]
}

// Cut one contiguous buffer into `pieces` fragments of roughly equal size
pub fn split(whole: Fragment, pieces: u8) -> Vec<Fragment> {
    let pieces = (pieces.max(1) as u16).min(whole.length.max(1));
    let chunk = whole.length / pieces;
    (0..pieces)
        .map(|i| {
            let offset = i * chunk;
            let length = if i == pieces - 1 {
                whole.length - offset
            } else {
                chunk
            };
            Fragment::new(whole.address + offset as u32, length)
        })
        .collect()
}

#[derive(Default)]
pub struct TrafficCounters {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub corrupt: AtomicU64,
    pub released: AtomicU64,
}

// Sink checking every received frame, counters are shared with main
pub struct VerifyingSink {
    pub counters: Arc<TrafficCounters>,
}

impl PacketSink for VerifyingSink {
    fn receive(&mut self, payload: &[u8]) {
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        if !ipv4_header_valid(payload) {
            trace!("Received frame with broken IPv4 header");
            self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn released(&mut self, _fragment: Fragment) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}
