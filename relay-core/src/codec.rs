//! CAN packet wire formats.
//!
//! Current firmware speaks the checksummed format: a 6 byte header (length
//! code and bus, little-endian address word, XOR checksum) followed by 0-64
//! payload bytes. Firmware that still advertises CAN packet version 1 uses
//! fixed 16 byte packets without a checksum, handled by [`LegacyCodec`].

use crate::{RelayError, Result};

use relay_common::{len_to_dlc, DLC_TO_LEN, CAN_PACKET_VERSION, LEGACY_CAN_PACKET_VERSION};

pub const MAX_PAYLOAD: usize = 64;
pub const HEADER_SIZE: usize = 6;
/// Chunks are closed once they grow past this, never mid-frame
pub const CHUNK_LIMIT: usize = 256;
pub const EXTENDED_ADDRESS_START: u32 = 0x800;
pub const MAX_ADDRESS: u32 = (1 << 29) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub address: u32,
    /// Bus number on send. On receive the firmware marks echoed frames with
    /// +128 (returned) and refused ones with +192 (rejected); both offsets
    /// are applied independently and may stack.
    pub bus: u16,
    pub data: heapless::Vec<u8, MAX_PAYLOAD>,
}

impl CanFrame {
    pub fn new(address: u32, bus: u16, data: &[u8]) -> Result<Self> {
        let data =
            heapless::Vec::from_slice(data).map_err(|_| RelayError::InvalidDataLength(data.len()))?;
        Ok(Self { address, bus, data })
    }

    pub fn is_extended(&self) -> bool {
        self.address >= EXTENDED_ADDRESS_START
    }

    fn check_address(&self) -> Result<()> {
        if self.address > MAX_ADDRESS {
            return Err(RelayError::InvalidAddress(self.address));
        }
        Ok(())
    }
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// A CAN packet encoding understood by some firmware generation
pub trait WireCodec {
    /// CAN packet version the firmware advertises for this encoding
    const PACKET_VERSION: u8;

    /// Serialize frames into bulk transfer sized chunks
    fn encode(frames: &[CanFrame]) -> Result<Vec<Vec<u8>>>;

    /// Parse as many whole packets as `buf` holds. The bytes of a trailing
    /// partial packet come back untouched so they can be prefixed to the
    /// next read.
    fn decode(buf: &[u8]) -> Result<(Vec<CanFrame>, Vec<u8>)>;
}

pub struct ChecksummedCodec;

impl WireCodec for ChecksummedCodec {
    const PACKET_VERSION: u8 = CAN_PACKET_VERSION;

    fn encode(frames: &[CanFrame]) -> Result<Vec<Vec<u8>>> {
        let mut chunks = Vec::new();
        let mut current = Vec::new();

        for frame in frames {
            let dlc = len_to_dlc(frame.data.len())
                .ok_or(RelayError::InvalidDataLength(frame.data.len()))?;
            if frame.bus > 7 {
                return Err(RelayError::InvalidBus(frame.bus));
            }
            frame.check_address()?;

            let word = (frame.address << 3) | ((frame.is_extended() as u32) << 2);
            let mut header = [0_u8; HEADER_SIZE];
            header[0] = (dlc << 4) | ((frame.bus as u8) << 1);
            header[1..5].copy_from_slice(&word.to_le_bytes());
            header[5] = checksum(&header[..5]) ^ checksum(&frame.data);

            current.extend_from_slice(&header);
            current.extend_from_slice(&frame.data);
            if current.len() > CHUNK_LIMIT {
                chunks.push(std::mem::take(&mut current));
            }
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        Ok(chunks)
    }

    fn decode(buf: &[u8]) -> Result<(Vec<CanFrame>, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut pos = 0;

        while buf.len() - pos >= HEADER_SIZE {
            let header = &buf[pos..pos + HEADER_SIZE];
            let data_len = DLC_TO_LEN[(header[0] >> 4) as usize];

            // rest of this packet comes with the next transfer
            if buf.len() - pos - HEADER_SIZE < data_len {
                break;
            }

            let packet = &buf[pos..pos + HEADER_SIZE + data_len];
            if checksum(packet) != 0 {
                return Err(RelayError::Checksum(pos));
            }

            let word = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
            let mut bus = ((header[0] >> 1) & 0x7) as u16;
            if (header[1] >> 1) & 0x1 == 1 {
                // returned
                bus += 128;
            }
            if header[1] & 0x1 == 1 {
                // rejected
                bus += 192;
            }

            frames.push(CanFrame::new(word >> 3, bus, &packet[HEADER_SIZE..])?);
            pos += HEADER_SIZE + data_len;
        }

        Ok((frames, buf[pos..].to_vec()))
    }
}

pub const LEGACY_PACKET_SIZE: usize = 16;
pub const LEGACY_MAX_PAYLOAD: usize = 8;
const LEGACY_PACKETS_PER_CHUNK: usize = 16;
const LEGACY_TRANSMIT: u32 = 0x1;
const LEGACY_EXTENDED: u32 = 0x4;

/// Fixed 16 byte packets: two little-endian descriptor words followed by
/// eight zero padded data bytes.
pub struct LegacyCodec;

impl WireCodec for LegacyCodec {
    const PACKET_VERSION: u8 = LEGACY_CAN_PACKET_VERSION;

    fn encode(frames: &[CanFrame]) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::with_capacity(frames.len());
        for frame in frames {
            if frame.data.len() > LEGACY_MAX_PAYLOAD {
                return Err(RelayError::InvalidDataLength(frame.data.len()));
            }
            if frame.bus > 0xf {
                return Err(RelayError::InvalidBus(frame.bus));
            }
            frame.check_address()?;

            let rir = if frame.is_extended() {
                (frame.address << 3) | LEGACY_EXTENDED | LEGACY_TRANSMIT
            } else {
                (frame.address << 21) | LEGACY_TRANSMIT
            };
            let mut packet = [0_u8; LEGACY_PACKET_SIZE];
            packet[..4].copy_from_slice(&rir.to_le_bytes());
            packet[4..8].copy_from_slice(&(frame.data.len() as u32 | ((frame.bus as u32) << 4)).to_le_bytes());
            packet[8..8 + frame.data.len()].copy_from_slice(&frame.data);
            packets.push(packet);
        }

        Ok(packets
            .chunks(LEGACY_PACKETS_PER_CHUNK)
            .map(|chunk| chunk.concat())
            .collect())
    }

    fn decode(buf: &[u8]) -> Result<(Vec<CanFrame>, Vec<u8>)> {
        let mut packets = buf.chunks_exact(LEGACY_PACKET_SIZE);
        let mut frames = Vec::new();

        for packet in &mut packets {
            let rir = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
            let dlen = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);

            let address = if rir & LEGACY_EXTENDED != 0 {
                rir >> 3
            } else {
                rir >> 21
            };
            let len = (dlen & 0xf) as usize;
            if len > LEGACY_MAX_PAYLOAD {
                return Err(RelayError::InvalidDataLength(len));
            }
            let bus = ((dlen >> 4) & 0xff) as u16;

            frames.push(CanFrame::new(address, bus, &packet[8..8 + len])?);
        }

        Ok((frames, packets.remainder().to_vec()))
    }
}

/// Codec selection, fixed for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    Checksummed,
    Legacy,
}

impl PacketFormat {
    /// Format matching what the firmware advertised. Unknown versions get the
    /// current format so the version check reports them properly.
    pub fn for_can_version(version: u8) -> Self {
        if version == LegacyCodec::PACKET_VERSION {
            PacketFormat::Legacy
        } else {
            PacketFormat::Checksummed
        }
    }

    pub fn packet_version(self) -> u8 {
        match self {
            PacketFormat::Checksummed => ChecksummedCodec::PACKET_VERSION,
            PacketFormat::Legacy => LegacyCodec::PACKET_VERSION,
        }
    }

    pub fn encode(self, frames: &[CanFrame]) -> Result<Vec<Vec<u8>>> {
        match self {
            PacketFormat::Checksummed => ChecksummedCodec::encode(frames),
            PacketFormat::Legacy => LegacyCodec::encode(frames),
        }
    }

    pub fn decode(self, buf: &[u8]) -> Result<(Vec<CanFrame>, Vec<u8>)> {
        match self {
            PacketFormat::Checksummed => ChecksummedCodec::decode(buf),
            PacketFormat::Legacy => LegacyCodec::decode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(address: u32, bus: u16, data: &[u8]) -> CanFrame {
        CanFrame::new(address, bus, data).unwrap()
    }

    /// Rewrites the checksum after a test has poked at a header
    fn reseal(packet: &mut [u8]) {
        packet[5] = 0;
        packet[5] = checksum(packet);
    }

    #[test]
    fn encode_decode_two_frames() {
        let frames = vec![frame(0x123, 0, &[0xaa; 4]), frame(0x900, 2, &[])];
        let chunks = ChecksummedCodec::encode(&frames).unwrap();
        assert_eq!(chunks.len(), 1);

        let buf = &chunks[0];
        assert_eq!(buf.len(), 6 + 4 + 6);
        // first frame is standard, second extended
        assert_eq!(buf[1] & 0x4, 0);
        assert_eq!(buf[10 + 1] & 0x4, 0x4);
        assert_eq!(buf[10] >> 4, 0);
        assert_eq!((buf[10] >> 1) & 0x7, 2);

        let (decoded, leftover) = ChecksummedCodec::decode(buf).unwrap();
        assert!(leftover.is_empty());
        assert_eq!(decoded, frames);
        assert!(decoded[1].is_extended());
        assert!(decoded.iter().all(|f| f.bus < 128));
    }

    #[test]
    fn header_layout() {
        let chunks = ChecksummedCodec::encode(&[frame(0x1abcdef, 5, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])]).unwrap();
        let packet = &chunks[0];
        assert_eq!(packet[0], (9 << 4) | (5 << 1));
        let word = (0x1abcdef_u32 << 3) | 0x4;
        assert_eq!(&packet[1..5], &word.to_le_bytes());
        assert_eq!(packet.len(), 6 + 12);
    }

    #[test]
    fn every_packet_checksums_to_zero() {
        let frames: Vec<_> = DLC_TO_LEN
            .iter()
            .enumerate()
            .map(|(i, &len)| frame(0x100 * i as u32 + 7, (i % 8) as u16, &vec![i as u8 ^ 0x5a; len]))
            .collect();

        for chunk in ChecksummedCodec::encode(&frames).unwrap() {
            let mut rest = &chunk[..];
            while !rest.is_empty() {
                let len = HEADER_SIZE + DLC_TO_LEN[(rest[0] >> 4) as usize];
                assert_eq!(checksum(&rest[..len]), 0);
                rest = &rest[len..];
            }
        }
    }

    #[test]
    fn round_trip_preserves_order() {
        let frames: Vec<_> = (0..40_u32)
            .map(|i| {
                let len = DLC_TO_LEN[(i % 16) as usize];
                frame(i * 0x0012_3457 % (MAX_ADDRESS + 1), (i % 8) as u16, &vec![i as u8; len])
            })
            .collect();

        let buf: Vec<u8> = ChecksummedCodec::encode(&frames).unwrap().concat();
        let (decoded, leftover) = ChecksummedCodec::decode(&buf).unwrap();
        assert!(leftover.is_empty());
        assert_eq!(decoded, frames);
    }

    #[test]
    fn chunks_close_after_crossing_limit() {
        // 70 bytes per packet
        let frames: Vec<_> = (0..10).map(|i| frame(i, 0, &[0x11; 64])).collect();
        let chunks = ChecksummedCodec::encode(&frames).unwrap();

        // four packets (280 bytes) cross the limit, the rest spills over
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![280, 280, 140]);
        for chunk in &chunks {
            assert!(chunk.len() <= CHUNK_LIMIT + HEADER_SIZE + MAX_PAYLOAD);
            let (decoded, leftover) = ChecksummedCodec::decode(chunk).unwrap();
            assert!(leftover.is_empty());
            assert!(!decoded.is_empty());
        }
    }

    #[test]
    fn nothing_to_send() {
        assert!(ChecksummedCodec::encode(&[]).unwrap().is_empty());
    }

    #[test]
    fn encode_rejects_bad_frames() {
        let mut odd = frame(0x10, 0, &[0; 8]);
        odd.data.push(0).unwrap();
        assert!(matches!(
            ChecksummedCodec::encode(&[odd]),
            Err(RelayError::InvalidDataLength(9))
        ));
        assert!(matches!(
            ChecksummedCodec::encode(&[frame(0x10, 8, &[])]),
            Err(RelayError::InvalidBus(8))
        ));
        assert!(matches!(
            ChecksummedCodec::encode(&[frame(1 << 29, 0, &[])]),
            Err(RelayError::InvalidAddress(_))
        ));
        assert!(CanFrame::new(0x10, 0, &[0; 65]).is_err());
    }

    #[test]
    fn truncated_tail_is_kept_for_next_read() {
        let first = frame(0x321, 1, &[1, 2, 3]);
        let second = frame(0x18daf110, 3, &[0xee; 24]);
        let buf = ChecksummedCodec::encode(&[first.clone(), second.clone()])
            .unwrap()
            .concat();

        for cut in [9 + 1, 9 + 5, 9 + 6, 9 + 20, buf.len() - 1] {
            let (decoded, leftover) = ChecksummedCodec::decode(&buf[..cut]).unwrap();
            assert_eq!(decoded, vec![first.clone()]);
            assert_eq!(leftover, &buf[9..cut]);

            let mut next = leftover;
            next.extend_from_slice(&buf[cut..]);
            let (decoded, leftover) = ChecksummedCodec::decode(&next).unwrap();
            assert_eq!(decoded, vec![second.clone()]);
            assert!(leftover.is_empty());
        }
    }

    #[test]
    fn short_header_is_leftover() {
        let (decoded, leftover) = ChecksummedCodec::decode(&[0x10, 0, 0]).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(leftover, vec![0x10, 0, 0]);
    }

    #[test]
    fn corrupted_packet_is_an_error() {
        let mut buf = ChecksummedCodec::encode(&[frame(0x55, 0, &[1, 2]), frame(0x56, 0, &[3, 4])])
            .unwrap()
            .concat();
        buf[8 + 6 + 1] ^= 0x40;
        assert!(matches!(
            ChecksummedCodec::decode(&buf),
            Err(RelayError::Checksum(8))
        ));
    }

    #[test]
    fn returned_and_rejected_flags() {
        let mut packet = ChecksummedCodec::encode(&[frame(0x200, 1, &[9])]).unwrap().remove(0);

        packet[1] |= 0x2;
        reseal(&mut packet);
        let (decoded, _) = ChecksummedCodec::decode(&packet).unwrap();
        assert_eq!(decoded[0].bus, 1 + 128);
        assert_eq!(decoded[0].address, 0x200);

        packet[1] &= !0x2;
        packet[1] |= 0x1;
        reseal(&mut packet);
        let (decoded, _) = ChecksummedCodec::decode(&packet).unwrap();
        assert_eq!(decoded[0].bus, 1 + 192);

        // both bits stack
        packet[1] |= 0x3;
        reseal(&mut packet);
        let (decoded, _) = ChecksummedCodec::decode(&packet).unwrap();
        assert_eq!(decoded[0].bus, 1 + 128 + 192);
        assert_eq!(decoded[0].address, 0x200);
    }

    #[test]
    fn legacy_round_trip() {
        let frames = vec![
            frame(0x7ff, 0, &[1, 2, 3]),
            frame(0x18daf110, 2, &[0xff; 8]),
            frame(0x10, 1, &[]),
        ];
        let chunks = LegacyCodec::encode(&frames).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 3 * LEGACY_PACKET_SIZE);
        // standard ids live in the top 11 bits
        assert_eq!(&chunks[0][..4], &((0x7ff_u32 << 21) | 1).to_le_bytes());
        assert_eq!(&chunks[0][8..16], &[1, 2, 3, 0, 0, 0, 0, 0]);

        let (decoded, leftover) = LegacyCodec::decode(&chunks[0]).unwrap();
        assert!(leftover.is_empty());
        assert_eq!(decoded, frames);
    }

    #[test]
    fn legacy_chunks_and_leftover() {
        let frames: Vec<_> = (0..20).map(|i| frame(i, 0, &[i as u8])).collect();
        let chunks = LegacyCodec::encode(&frames).unwrap();
        assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), vec![256, 64]);

        let (decoded, leftover) = LegacyCodec::decode(&chunks[1][..40]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(leftover.len(), 8);

        assert!(matches!(
            LegacyCodec::encode(&[frame(0x1, 0, &[0; 12])]),
            Err(RelayError::InvalidDataLength(12))
        ));
    }

    #[test]
    fn format_selection() {
        assert_eq!(PacketFormat::for_can_version(1), PacketFormat::Legacy);
        assert_eq!(PacketFormat::for_can_version(4), PacketFormat::Checksummed);
        assert_eq!(PacketFormat::for_can_version(0), PacketFormat::Checksummed);
        assert_eq!(PacketFormat::Legacy.packet_version(), 1);
        assert_eq!(PacketFormat::Checksummed.packet_version(), 4);
    }
}
