//! PM4 packet framing for the command processor.
//!
//! Two packet kinds are produced:
//! - type-7 packets: an opcode plus `count` payload words.
//! - type-4 packets: a write of `count` consecutive registers starting at `reg`.
//!
//! Both header kinds carry odd-parity bits over their count/opcode/register fields.

pub const TYPE4_PKT: u32 = 0x4 << 28;
pub const TYPE7_PKT: u32 = 0x7 << 28;

pub const TYPE7_MAX_COUNT: u32 = 0x3fff;
pub const TYPE4_MAX_COUNT: u32 = 0x7f;
pub const TYPE4_MAX_REG: u32 = 0x7ffff;

/// Odd parity of a header field, as expected by the command processor.
pub const fn odd_parity_bit(val: u32) -> u32 {
    let mut v = val;
    v ^= v >> 16;
    v ^= v >> 8;
    (0x9669 >> (0xf & (v ^ (v >> 4)))) & 1
}

pub const fn pkt7_header(opcode: u32, count: u32) -> u32 {
    TYPE7_PKT
        | count
        | (odd_parity_bit(count) << 15)
        | ((opcode & 0x7f) << 16)
        | (odd_parity_bit(opcode) << 23)
}

pub const fn pkt4_header(reg: u32, count: u32) -> u32 {
    TYPE4_PKT | count | (odd_parity_bit(count) << 7) | ((reg & TYPE4_MAX_REG) << 8) | (odd_parity_bit(reg) << 27)
}

/// Command processor opcodes used by the recorder.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop = 0x10,
    WaitMemWrites = 0x12,
    WaitForMe = 0x13,
    SkipIb2EnableGlobal = 0x1d,
    RegRmw = 0x21,
    DrawAuto = 0x24,
    WaitForIdle = 0x26,
    DrawIndirectMulti = 0x2a,
    SetBinData5Offset = 0x2e,
    LoadState6Geom = 0x32,
    ExecCs = 0x33,
    LoadState6Frag = 0x34,
    SetSubdrawSize = 0x35,
    DrawIndxOffset = 0x38,
    WaitRegMem = 0x3c,
    MemWrite = 0x3d,
    RegToMem = 0x3e,
    IndirectBuffer = 0x3f,
    ExecCsIndirect = 0x41,
    MemToReg = 0x42,
    SetDrawState = 0x43,
    CondWrite5 = 0x45,
    EventWrite = 0x46,
    CondRegExec = 0x47,
    Blit = 0x2c,
    SetMode = 0x63,
    SetVisibilityOverride = 0x64,
    SetMarker = 0x65,
    RegWrite = 0x6d,
    MemToMem = 0x73,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x10 => Self::Nop,
            0x12 => Self::WaitMemWrites,
            0x13 => Self::WaitForMe,
            0x1d => Self::SkipIb2EnableGlobal,
            0x21 => Self::RegRmw,
            0x24 => Self::DrawAuto,
            0x26 => Self::WaitForIdle,
            0x2a => Self::DrawIndirectMulti,
            0x2c => Self::Blit,
            0x2e => Self::SetBinData5Offset,
            0x32 => Self::LoadState6Geom,
            0x33 => Self::ExecCs,
            0x34 => Self::LoadState6Frag,
            0x35 => Self::SetSubdrawSize,
            0x38 => Self::DrawIndxOffset,
            0x3c => Self::WaitRegMem,
            0x3d => Self::MemWrite,
            0x3e => Self::RegToMem,
            0x3f => Self::IndirectBuffer,
            0x41 => Self::ExecCsIndirect,
            0x42 => Self::MemToReg,
            0x43 => Self::SetDrawState,
            0x45 => Self::CondWrite5,
            0x46 => Self::EventWrite,
            0x47 => Self::CondRegExec,
            0x63 => Self::SetMode,
            0x64 => Self::SetVisibilityOverride,
            0x65 => Self::SetMarker,
            0x6d => Self::RegWrite,
            0x73 => Self::MemToMem,
            _ => return None,
        })
    }
}

/// Events written through `CP_EVENT_WRITE`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VgtEvent {
    CacheFlushTs = 4,
    WtDoneTs = 8,
    FlushSo0 = 17,
    FlushSo1 = 18,
    FlushSo2 = 19,
    FlushSo3 = 20,
    RbDoneTs = 22,
    PcCcuInvalidateDepth = 24,
    PcCcuInvalidateColor = 25,
    PcCcuResolveTs = 26,
    PcCcuFlushDepthTs = 28,
    PcCcuFlushColorTs = 29,
    Blit = 30,
    CacheInvalidate = 31,
    LrzFlush = 38,
    HlsqInvalidate = 40,
    BinningStart = 44,
    BinningEnd = 45,
}

impl VgtEvent {
    /// Timestamp events write a seqno to memory and carry three extra payload words.
    pub fn writes_seqno(self) -> bool {
        matches!(
            self,
            Self::CacheFlushTs
                | Self::WtDoneTs
                | Self::RbDoneTs
                | Self::PcCcuFlushDepthTs
                | Self::PcCcuFlushColorTs
                | Self::PcCcuResolveTs
        )
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            4 => Self::CacheFlushTs,
            8 => Self::WtDoneTs,
            17 => Self::FlushSo0,
            18 => Self::FlushSo1,
            19 => Self::FlushSo2,
            20 => Self::FlushSo3,
            22 => Self::RbDoneTs,
            24 => Self::PcCcuInvalidateDepth,
            25 => Self::PcCcuInvalidateColor,
            26 => Self::PcCcuResolveTs,
            28 => Self::PcCcuFlushDepthTs,
            29 => Self::PcCcuFlushColorTs,
            30 => Self::Blit,
            31 => Self::CacheInvalidate,
            38 => Self::LrzFlush,
            40 => Self::HlsqInvalidate,
            44 => Self::BinningStart,
            45 => Self::BinningEnd,
            _ => return None,
        })
    }
}

/// Decoded header of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    Type7 { opcode: u32, count: u32 },
    Type4 { reg: u32, count: u32 },
}

impl PacketHeader {
    pub fn decode(word: u32) -> Option<Self> {
        match word & 0xf000_0000 {
            TYPE7_PKT => Some(Self::Type7 {
                opcode: (word >> 16) & 0x7f,
                count: word & TYPE7_MAX_COUNT,
            }),
            TYPE4_PKT => Some(Self::Type4 {
                reg: (word >> 8) & TYPE4_MAX_REG,
                count: word & TYPE4_MAX_COUNT,
            }),
            _ => None,
        }
    }

    pub fn count(&self) -> u32 {
        match *self {
            Self::Type7 { count, .. } | Self::Type4 { count, .. } => count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_matches_popcount() {
        for v in [0u32, 1, 2, 3, 0x7f, 0x3fff, 0x12345, 0x46] {
            let expected = if v.count_ones() % 2 == 0 { 1 } else { 0 };
            assert_eq!(odd_parity_bit(v), expected, "value {v:#x}");
        }
    }

    #[test]
    fn headers_decode_back() {
        let h = pkt7_header(Opcode::SetDrawState as u32, 9);
        assert_eq!(
            PacketHeader::decode(h),
            Some(PacketHeader::Type7 {
                opcode: Opcode::SetDrawState as u32,
                count: 9
            })
        );

        let h = pkt4_header(0x8e07, 3);
        assert_eq!(
            PacketHeader::decode(h),
            Some(PacketHeader::Type4 { reg: 0x8e07, count: 3 })
        );

        assert_eq!(PacketHeader::decode(0), None);
    }

    #[test]
    fn only_timestamp_events_carry_seqno() {
        assert!(VgtEvent::CacheFlushTs.writes_seqno());
        assert!(VgtEvent::PcCcuFlushColorTs.writes_seqno());
        assert!(!VgtEvent::CacheInvalidate.writes_seqno());
        assert!(!VgtEvent::LrzFlush.writes_seqno());
    }
}
