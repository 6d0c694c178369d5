//! PSRP fragment framing.
//!
//! Wire layout (big-endian): ObjectId u64, FragmentId u64, flags u8
//! (bit 0 start, bit 1 end), BlobLength u32, then BlobLength payload bytes.
//! A single transport blob may hold several fragments back to back.

use crate::error::FragmentError;

pub const FRAGMENT_HEADER_LEN: usize = 21;
pub const START_FLAG: u8 = 0x01;
pub const END_FLAG: u8 = 0x02;

/// One PSRP fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub object_id: u64,
    pub fragment_id: u64,
    pub start: bool,
    pub end: bool,
    pub data: Vec<u8>,
}

impl Fragment {
    pub fn new(object_id: u64, fragment_id: u64, start: bool, end: bool, data: Vec<u8>) -> Self {
        Self {
            object_id,
            fragment_id,
            start,
            end,
            data,
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.start {
            flags |= START_FLAG;
        }
        if self.end {
            flags |= END_FLAG;
        }
        flags
    }

    /// Serialize with the wire header.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.data.len());
        out.extend_from_slice(&self.object_id.to_be_bytes());
        out.extend_from_slice(&self.fragment_id.to_be_bytes());
        out.push(self.flags());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Decode the fragment starting at `offset`, returning it with the offset
    /// of the next one.
    pub fn decode_at(blob: &[u8], offset: usize) -> Result<(Fragment, usize), FragmentError> {
        let available = blob.len().saturating_sub(offset);
        if available < FRAGMENT_HEADER_LEN {
            return Err(FragmentError::TruncatedHeader { offset, available });
        }
        let header = &blob[offset..offset + FRAGMENT_HEADER_LEN];
        let object_id = u64::from_be_bytes(read_array(&header[0..8]));
        let fragment_id = u64::from_be_bytes(read_array(&header[8..16]));
        let flags = header[16];
        let declared = u32::from_be_bytes(read_array(&header[17..21])) as usize;

        let data_start = offset + FRAGMENT_HEADER_LEN;
        let remaining = blob.len() - data_start;
        if declared > remaining {
            return Err(FragmentError::TruncatedPayload {
                offset,
                declared,
                available: remaining,
            });
        }

        let fragment = Fragment {
            object_id,
            fragment_id,
            start: flags & START_FLAG != 0,
            end: flags & END_FLAG != 0,
            data: blob[data_start..data_start + declared].to_vec(),
        };
        Ok((fragment, data_start + declared))
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Iterator over the fragments packed into one transport blob.
///
/// Stops after the first framing error, which it yields.
pub struct Fragments<'a> {
    blob: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Result<Fragment, FragmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.blob.len() {
            return None;
        }
        match Fragment::decode_at(self.blob, self.offset) {
            Ok((fragment, next)) => {
                self.offset = next;
                Some(Ok(fragment))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

pub fn fragments(blob: &[u8]) -> Fragments<'_> {
    Fragments {
        blob,
        offset: 0,
        failed: false,
    }
}

/// Split a message into fragments of at most `max_payload` bytes.
pub fn fragment_message(object_id: u64, message: &[u8], max_payload: usize) -> Vec<Fragment> {
    let max_payload = max_payload.max(1);
    if message.is_empty() {
        return vec![Fragment::new(object_id, 0, true, true, Vec::new())];
    }
    let chunks: Vec<&[u8]> = message.chunks(max_payload).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| Fragment::new(object_id, i as u64, i == 0, i == last, chunk.to_vec()))
        .collect()
}
