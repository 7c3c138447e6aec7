//! MP3 length estimation from the first Layer III frame header.
//!
//! Decoders report no total length for plain MP3 streams, so the play time
//! is derived from the byte count and the bitrate the stream declares. Tags
//! are excluded from the count. VBR streams are timed at their first
//! frame's rate.

use std::time::Duration;

/// kbit/s by bitrate index, MPEG-1 Layer III.
const MPEG1_L3_KBPS: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];

/// kbit/s by bitrate index, MPEG-2 and 2.5 Layer III.
const MPEG2_L3_KBPS: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// How far past the ID3v2 tag to look for the first frame.
const SYNC_SEARCH: usize = 64 * 1024;

const ID3V1_LEN: usize = 128;

/// Bitrate in bits per second declared by the first valid frame header,
/// with the byte offset where audio starts.
pub fn first_frame_bitrate(bytes: &[u8]) -> Option<(usize, u32)> {
    let start = id3v2_len(bytes);
    let end = bytes.len().min(start.saturating_add(SYNC_SEARCH));
    (start..end.saturating_sub(3)).find_map(|at| {
        let header: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
        header_bitrate(header).map(|bps| (at, bps))
    })
}

/// Play time of an MP3 stream, or `None` when no frame header is found.
pub fn estimate_duration(bytes: &[u8]) -> Option<Duration> {
    let (start, bps) = first_frame_bitrate(bytes)?;
    let mut end = bytes.len();
    if end - start >= ID3V1_LEN && bytes[end - ID3V1_LEN..].starts_with(b"TAG") {
        end -= ID3V1_LEN;
    }
    let bits = (end - start) as f64 * 8.0;
    Some(Duration::from_secs_f64(bits / bps as f64))
}

fn header_bitrate([b0, b1, b2, _]: [u8; 4]) -> Option<u32> {
    if b0 != 0xFF || b1 & 0xE0 != 0xE0 {
        return None;
    }
    let version = (b1 >> 3) & 0b11;
    let layer = (b1 >> 1) & 0b11;
    // 0b01 is the reserved version; layer 0b01 is Layer III.
    if version == 0b01 || layer != 0b01 {
        return None;
    }
    let index = usize::from(b2 >> 4);
    let sample_rate = (b2 >> 2) & 0b11;
    if index == 0 || index >= 15 || sample_rate == 0b11 {
        return None;
    }
    let table = if version == 0b11 { &MPEG1_L3_KBPS } else { &MPEG2_L3_KBPS };
    Some(table[index] * 1000)
}

/// Length of a leading ID3v2 tag, footer included.
fn id3v2_len(bytes: &[u8]) -> usize {
    if bytes.len() < 10 || !bytes.starts_with(b"ID3") {
        return 0;
    }
    let size = bytes[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | usize::from(b & 0x7F));
    let footer = if bytes[5] & 0x10 != 0 { 10 } else { 0 };
    (10 + size + footer).min(bytes.len())
}
