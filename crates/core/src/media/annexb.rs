//! Annex B byte-stream helpers shared by the H.264 and H.265 code.
//!
//! Annex B bitstreams delimit NAL units with start codes:
//! - 4-byte: `0x00 0x00 0x00 0x01`
//! - 3-byte: `0x00 0x00 0x01`

use bytes::{Buf, Bytes, BytesMut};

/// Largest access unit the splitter will buffer. Anything bigger is
/// dropped.
pub const MAX_ACCESS_UNIT_LEN: usize = 8 * 1024 * 1024;

/// First start code at or after `from`, as (position, length).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            return Some((i, 4));
        }
        if data[i..i + 3] == [0, 0, 1] {
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Position and length of every start code in `data`.
///
/// The start code length is tracked per entry so that boundaries
/// between adjacent NALs are correct when 3-byte and 4-byte start codes
/// are mixed.
pub fn start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut from = 0;
    while let Some((pos, len)) = find_start_code(data, from) {
        found.push((pos, len));
        from = pos + len;
    }
    found
}

/// A NAL unit located inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalSpan {
    /// Offset of the start code preceding the NAL.
    pub start_code: usize,
    /// Offset of the first NAL header byte.
    pub payload: usize,
    /// One past the last NAL byte.
    pub end: usize,
}

/// NAL units in `data` whose end is known.
///
/// The last NAL is complete only if `data_is_final` is set; otherwise its
/// end is still unknown and it is left out.
pub fn nal_spans(data: &[u8], data_is_final: bool) -> Vec<NalSpan> {
    let codes = start_codes(data);
    let mut spans = Vec::with_capacity(codes.len());

    for (idx, &(pos, len)) in codes.iter().enumerate() {
        let end = match codes.get(idx + 1) {
            Some(&(next, _)) => next,
            None if data_is_final => data.len(),
            None => break,
        };
        spans.push(NalSpan {
            start_code: pos,
            payload: pos + len,
            end,
        });
    }

    spans
}

/// How a NAL unit relates to access-unit boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalRole {
    /// Slice data. `first_in_picture` is set when the slice header says it
    /// is the first slice of a new picture.
    Vcl { first_in_picture: bool },
    /// A NAL that may only precede the first VCL NAL of an access unit
    /// (delimiter, parameter sets, prefix SEI, ...).
    Prefix,
    /// Anything else; stays with the current access unit.
    Other,
}

/// Incremental Annex B access-unit splitter.
///
/// Leading bytes before the first start code are dropped. A new access
/// unit starts at the first prefix NAL, or first-in-picture VCL NAL, that
/// follows a VCL NAL. With `at_eos` set the end of data closes the last
/// NAL; the trailing unit is emitted only if it holds a VCL NAL.
///
/// The scan resumes where the previous call stopped, so every byte is
/// searched for start codes about once. Until a start code shows up only
/// a 3-byte tail is kept, and a unit growing past [`MAX_ACCESS_UNIT_LEN`]
/// is discarded.
#[derive(Debug, Default)]
pub struct AnnexBSplitter {
    /// Start code of the NAL whose end is not known yet.
    open: Option<(usize, usize)>,
    /// Where the next start code search begins.
    cursor: usize,
    /// A VCL NAL has been closed inside the current unit.
    seen_vcl: bool,
}

impl AnnexBSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    /// Split the next complete access unit off the front of `buf`.
    ///
    /// `buf` must only grow at the back between calls.
    pub fn next_unit(
        &mut self,
        buf: &mut BytesMut,
        at_eos: bool,
        classify: fn(&[u8]) -> NalRole,
    ) -> Option<Bytes> {
        let (mut code_pos, mut code_len) = match self.open {
            Some(code) => code,
            None => match find_start_code(buf, self.cursor) {
                Some((pos, len)) => {
                    if pos > 0 {
                        tracing::trace!(skipped = pos, "dropping bytes before first start code");
                        buf.advance(pos);
                    }
                    self.open = Some((0, len));
                    self.cursor = len;
                    (0, len)
                }
                None => {
                    let skipped = buf.len().saturating_sub(3);
                    if skipped > 0 {
                        tracing::trace!(skipped, "no start code, dropping bytes");
                        buf.advance(skipped);
                    }
                    self.cursor = 0;
                    return None;
                }
            },
        };

        loop {
            let payload = code_pos + code_len;
            let next = find_start_code(buf, self.cursor);
            let end = match next {
                Some((pos, _)) => pos,
                None if at_eos => buf.len(),
                None => {
                    self.cursor = self.cursor.max(buf.len().saturating_sub(3));
                    if buf.len() > MAX_ACCESS_UNIT_LEN {
                        tracing::warn!(
                            buffered = buf.len(),
                            limit = MAX_ACCESS_UNIT_LEN,
                            "access unit too large, dropping buffered data"
                        );
                        buf.clear();
                        self.reset();
                    }
                    return None;
                }
            };

            if payload < end {
                let role = classify(&buf[payload..end]);
                let starts_new = match role {
                    NalRole::Prefix => true,
                    NalRole::Vcl { first_in_picture } => first_in_picture,
                    NalRole::Other => false,
                };
                if self.seen_vcl && starts_new {
                    let unit = buf.split_to(code_pos).freeze();
                    // The NAL that opened the new unit is classified again
                    // on the next call.
                    self.open = Some((0, code_len));
                    self.cursor = code_len;
                    self.seen_vcl = false;
                    return Some(unit);
                }
                if matches!(role, NalRole::Vcl { .. }) {
                    self.seen_vcl = true;
                }
            }

            match next {
                Some((pos, len)) => {
                    (code_pos, code_len) = (pos, len);
                    self.open = Some((pos, len));
                    self.cursor = pos + len;
                }
                None => {
                    // End of stream closed the last NAL.
                    let emit = self.seen_vcl;
                    self.reset();
                    if emit {
                        let len = buf.len();
                        return Some(buf.split_to(len).freeze());
                    }
                    return None;
                }
            }
        }
    }
}

/// Extract NAL unit payloads (without start codes) from an Annex B buffer.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    nal_spans(data, true)
        .into_iter()
        .filter(|s| s.payload < s.end)
        .map(|s| &data[s.payload..s.end])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = split_nal_units(&data);
        assert_eq!(nals, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn extract_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        let nals = split_nal_units(&data);
        assert_eq!(nals, vec![&[0x67, 0x42, 0x00][..]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = split_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68, 0xCE]);
    }

    #[test]
    fn extract_empty_data() {
        assert!(split_nal_units(&[]).is_empty());
    }

    #[test]
    fn extract_no_start_code() {
        assert!(split_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    fn classify_h265(nal: &[u8]) -> NalRole {
        let nal_type = (nal[0] >> 1) & 0x3f;
        match nal_type {
            0..=31 => NalRole::Vcl {
                first_in_picture: nal.len() > 2 && nal[2] & 0x80 != 0,
            },
            32..=35 | 39 => NalRole::Prefix,
            _ => NalRole::Other,
        }
    }

    #[test]
    fn splits_on_prefix_after_vcl() {
        // VPS, IDR slice | AUD, TRAIL slice (incomplete)
        let data = [
            0, 0, 0, 1, 0x40, 0x01, 0x0C, //
            0, 0, 0, 1, 0x26, 0x01, 0xAF, //
            0, 0, 0, 1, 0x46, 0x01, 0x50, //
            0, 0, 0, 1, 0x02, 0x01, 0xD0,
        ];
        let mut buf = BytesMut::from(&data[..]);
        let mut splitter = AnnexBSplitter::new();
        let au = splitter.next_unit(&mut buf, false, classify_h265).unwrap();
        assert_eq!(&au[..], &data[..14]);
        assert_eq!(&buf[..], &data[14..]);

        // The second unit is only complete at end of stream.
        assert!(splitter.next_unit(&mut buf, false, classify_h265).is_none());
        let last = splitter.next_unit(&mut buf, true, classify_h265).unwrap();
        assert_eq!(&last[..], &data[14..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn drops_garbage_before_start_code() {
        let data = [0xFF, 0xEE, 0, 0, 1, 0x26, 0x01, 0x80];
        let mut buf = BytesMut::from(&data[..]);
        let au = AnnexBSplitter::new()
            .next_unit(&mut buf, true, classify_h265)
            .unwrap();
        assert_eq!(&au[..], &data[2..]);
    }

    #[test]
    fn trailing_unit_without_slice_is_not_emitted() {
        let data = [0, 0, 0, 1, 0x40, 0x01, 0x0C];
        let mut buf = BytesMut::from(&data[..]);
        assert!(AnnexBSplitter::new().next_unit(&mut buf, true, classify_h265).is_none());
        assert_eq!(buf.len(), data.len());
    }

    #[test]
    fn start_code_split_across_reads() {
        // VPS, IDR slice | AUD, TRAIL slice, delivered a few bytes at a time
        let data = [
            0, 0, 0, 1, 0x40, 0x01, 0x0C, //
            0, 0, 0, 1, 0x26, 0x01, 0xAF, //
            0, 0, 0, 1, 0x46, 0x01, 0x50, //
            0, 0, 0, 1, 0x02, 0x01, 0xD0,
        ];
        let mut splitter = AnnexBSplitter::new();
        let mut buf = BytesMut::new();
        let mut units = Vec::new();
        for chunk in data.chunks(3) {
            buf.extend_from_slice(chunk);
            if let Some(au) = splitter.next_unit(&mut buf, false, classify_h265) {
                units.push(au);
            }
        }
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &data[..14]);
        assert_eq!(&buf[..], &data[14..]);
    }

    #[test]
    fn keeps_only_a_tail_without_start_code() {
        let mut splitter = AnnexBSplitter::new();
        let mut buf = BytesMut::new();
        for _ in 0..64 {
            buf.extend_from_slice(&[0xAA; 4096]);
            assert!(splitter.next_unit(&mut buf, false, classify_h265).is_none());
            assert!(buf.len() <= 3);
        }

        // A start code split over the retained tail is still found.
        buf.extend_from_slice(&[0, 0]);
        assert!(splitter.next_unit(&mut buf, false, classify_h265).is_none());
        buf.extend_from_slice(&[0, 1, 0x26, 0x01, 0x80]);
        let au = splitter.next_unit(&mut buf, true, classify_h265).unwrap();
        assert_eq!(&au[..], &[0, 0, 0, 1, 0x26, 0x01, 0x80]);
    }

    #[test]
    fn oversized_unit_is_dropped() {
        let mut splitter = AnnexBSplitter::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0x26, 0x01, 0x80][..]);
        let filler = vec![0xAA; 1024 * 1024];
        for _ in 0..=MAX_ACCESS_UNIT_LEN / filler.len() {
            buf.extend_from_slice(&filler);
            assert!(splitter.next_unit(&mut buf, false, classify_h265).is_none());
        }
        assert!(buf.len() <= 3);

        // Splitting resumes with the next start code.
        buf.extend_from_slice(&[0, 0, 0, 1, 0x26, 0x01, 0x80]);
        let au = splitter.next_unit(&mut buf, true, classify_h265).unwrap();
        assert_eq!(&au[..], &[0, 0, 0, 1, 0x26, 0x01, 0x80]);
    }

    #[test]
    fn last_nal_open_until_final() {
        let data = [0, 0, 0, 1, 0x40, 0x01, 0, 0, 0, 1, 0x26, 0x01, 0xAF];
        let open = nal_spans(&data, false);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].end, 6);

        let closed = nal_spans(&data, true);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[1].end, data.len());
    }
}
