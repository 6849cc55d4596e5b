//! MPEG-TS payload extraction from multicast datagrams
//!
//! Sources either send raw TS (datagram starts with the sync byte) or wrap
//! it in RTP. Only the TS bytes are relayed.

/// MPEG-TS sync byte
pub const TS_SYNC_BYTE: u8 = 0x47;

const RTP_VERSION: u8 = 2;
const RTP_HEADER_LEN: usize = 12;

/// MPEG audio (RFC 2250), carries a 4-byte payload header
const PT_MPEG_AUDIO: u8 = 14;
/// MPEG video (RFC 2250), carries a 4-byte payload header
const PT_MPEG_VIDEO: u8 = 32;
/// MPEG-2 transport stream
const PT_MPEG_TS: u8 = 33;

/// Return the TS bytes carried by `datagram`
///
/// Raw TS is returned as is. RTP is stripped of its fixed header, CSRC
/// list, extension, payload header and padding. `None` means the datagram
/// carries nothing relayable.
pub fn extract_payload(datagram: &[u8]) -> Option<&[u8]> {
    let first = *datagram.first()?;
    if first == TS_SYNC_BYTE {
        return Some(datagram);
    }

    if first >> 6 != RTP_VERSION {
        tracing::trace!(byte = first, "Not an RTP datagram");
        return None;
    }

    let has_padding = first & 0x20 != 0;
    let has_extension = first & 0x10 != 0;
    let csrc_count = (first & 0x0F) as usize;

    let mut header_len = RTP_HEADER_LEN + 4 * csrc_count;
    let extension_at = header_len;
    if has_extension {
        header_len += 4;
    }
    if datagram.len() < header_len {
        tracing::trace!(len = datagram.len(), "RTP datagram too short");
        return None;
    }

    match datagram[1] & 0x7F {
        PT_MPEG_AUDIO | PT_MPEG_VIDEO => header_len += 4,
        PT_MPEG_TS => {}
        pt => {
            tracing::trace!(payload_type = pt, "Unsupported RTP payload type");
            return None;
        }
    }

    if has_extension {
        let words = u16::from_be_bytes([datagram[extension_at + 2], datagram[extension_at + 3]]);
        header_len += 4 * words as usize;
    }

    let mut end = datagram.len();
    if has_padding {
        let padding = datagram[end - 1] as usize;
        if header_len + padding > end {
            tracing::trace!(padding, "Invalid RTP padding");
            return None;
        }
        end -= padding;
    }

    match datagram.get(header_len..end) {
        Some(payload) if payload.first() == Some(&TS_SYNC_BYTE) => Some(payload),
        _ => {
            tracing::trace!("RTP payload is not MPEG-TS");
            None
        }
    }
}
