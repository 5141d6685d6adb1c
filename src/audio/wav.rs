//! # WAV Assembly
//!
//! Builds the RIFF/WAVE container around raw PCM for the transcription
//! providers and the archive uploads. The gateway only ever deals in one
//! format — 16 kHz, 16-bit, mono, little-endian — so the 44-byte header is a
//! constant template with exactly two payload-dependent fields: the RIFF
//! chunk size and the `data` chunk size.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Sample rate the whole pipeline is contracted to.
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes of PCM per millisecond of audio (16 kHz × 2 bytes per sample).
pub const BYTES_PER_MS: usize = 32;

/// Size of the RIFF/WAVE header this module emits.
pub const HEADER_LEN: usize = 44;

const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const BYTE_RATE: u32 = SAMPLE_RATE * 2;
const BLOCK_ALIGN: u16 = 2;

/// Concatenate PCM segments and prepend the 44-byte RIFF/WAVE header.
///
/// ## Parameters:
/// - **segments**: ordered PCM byte segments; assumed native little-endian
///   16-bit mono at 16 kHz (the gateway does not validate or re-encode)
///
/// ## Returns:
/// The complete WAV blob: header followed by every segment in order.
pub fn assemble_wav(segments: &[Vec<u8>]) -> Vec<u8> {
    let data_size: usize = segments.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(HEADER_LEN + data_size);

    write_header(&mut out, data_size as u32);
    for segment in segments {
        out.extend_from_slice(segment);
    }
    out
}

/// Build a WAV blob from a single contiguous PCM buffer.
pub fn wrap_pcm(pcm: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len());
    write_header(&mut out, pcm.len() as u32);
    out.extend_from_slice(pcm);
    out
}

fn write_header(out: &mut Vec<u8>, data_size: u32) {
    // The write_* calls below cannot fail on a Vec sink
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>(36 + data_size).unwrap();
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.write_u32::<LittleEndian>(16).unwrap();
    out.write_u16::<LittleEndian>(1).unwrap(); // PCM
    out.write_u16::<LittleEndian>(CHANNELS).unwrap();
    out.write_u32::<LittleEndian>(SAMPLE_RATE).unwrap();
    out.write_u32::<LittleEndian>(BYTE_RATE).unwrap();
    out.write_u16::<LittleEndian>(BLOCK_ALIGN).unwrap();
    out.write_u16::<LittleEndian>(BITS_PER_SAMPLE).unwrap();
    out.extend_from_slice(b"data");
    out.write_u32::<LittleEndian>(data_size).unwrap();
}

/// Parsed view of a WAV header this module wrote.
#[derive(Debug, PartialEq, Eq)]
pub struct WavInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub data_len: usize,
}

impl WavInfo {
    /// Duration of the PCM body in whole seconds (rounded down).
    pub fn duration_seconds(&self) -> u64 {
        let bytes_per_second =
            self.sample_rate as u64 * self.channels as u64 * (self.bits_per_sample as u64 / 8);
        if bytes_per_second == 0 {
            return 0;
        }
        self.data_len as u64 / bytes_per_second
    }
}

/// Read back the fixed header this module writes.
///
/// Only the layout `assemble_wav` produces is accepted; arbitrary RIFF files
/// (extra chunks, compressed formats) are rejected.
pub fn parse_header(wav: &[u8]) -> Result<WavInfo, String> {
    if wav.len() < HEADER_LEN {
        return Err(format!("WAV too short: {} bytes", wav.len()));
    }
    if &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
        return Err("missing RIFF/WAVE magic".to_string());
    }
    if &wav[12..16] != b"fmt " || &wav[36..40] != b"data" {
        return Err("unexpected chunk layout".to_string());
    }

    let mut cursor = Cursor::new(&wav[16..]);
    let fmt_size = cursor.read_u32::<LittleEndian>().map_err(|e| e.to_string())?;
    let audio_format = cursor.read_u16::<LittleEndian>().map_err(|e| e.to_string())?;
    if fmt_size != 16 || audio_format != 1 {
        return Err("not plain PCM".to_string());
    }
    let channels = cursor.read_u16::<LittleEndian>().map_err(|e| e.to_string())?;
    let sample_rate = cursor.read_u32::<LittleEndian>().map_err(|e| e.to_string())?;
    let _byte_rate = cursor.read_u32::<LittleEndian>().map_err(|e| e.to_string())?;
    let _block_align = cursor.read_u16::<LittleEndian>().map_err(|e| e.to_string())?;
    let bits_per_sample = cursor.read_u16::<LittleEndian>().map_err(|e| e.to_string())?;

    let mut data_cursor = Cursor::new(&wav[40..]);
    let data_len = data_cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| e.to_string())? as usize;
    if wav.len() < HEADER_LEN + data_len {
        return Err("data chunk size exceeds file length".to_string());
    }

    Ok(WavInfo {
        sample_rate,
        channels,
        bits_per_sample,
        data_len,
    })
}
