/* Extraction of dives from circular on-device profile memory: linearizing
 * a ring around its end-of-profile pointer, walking trailing-length dive
 * blocks newest to oldest, and the marker-delimited walk used by devices
 * that separate dives with end-of-dive bytes. */
use tracing::debug;

use crate::error::{Error, Result};

/* Dive-mode byte of an unwritten (factory-erased) block. */
const UNWRITTEN: u8 = 0xFF;

/* Circular layout of one persistent memory region, plus where the dive    */
/* blocks keep their bookkeeping fields.                                   */
#[derive(Debug, Clone, Copy)]
pub struct RingLayout {
    pub begin: usize,
    pub end: usize,
    /* Offset in the dump of the little-endian end-of-profile pointer. */
    pub eop_offset: usize,
    /* Scratch region holding the newest freedive session's samples. */
    pub freedive_begin: usize,
    pub freedive_end: usize,
    pub header_size: usize,
    pub sample_size: usize,
    /* Offset inside the header of the little-endian sample count. */
    pub nsamples_offset: usize,
    /* Dive-mode byte value marking a freedive session, if the family     */
    /* has one.                                                           */
    pub freedive_mode: Option<u8>,
    pub fingerprint_offset: usize,
    pub fingerprint_size: usize,
}

impl RingLayout {
    pub fn profile_size(&self) -> usize {
        self.end - self.begin
    }

    pub fn freedive_size(&self) -> usize {
        self.freedive_end - self.freedive_begin
    }
}

/* Forward circular distance from `a` to `b` within `[begin, end)`. */
pub fn distance(a: usize, b: usize, begin: usize, end: usize) -> usize {
    let size = end - begin;
    (b + size - a) % size
}

/* Advance `p` by `delta` within `[begin, end)`, wrapping. */
pub fn increment(p: usize, delta: usize, begin: usize, end: usize) -> usize {
    let size = end - begin;
    begin + ((p - begin) + delta) % size
}

/* Read the end-of-profile pointer and rotate the ring so the write head   */
/* lands at the end of the returned buffer: `[eop, end)` then              */
/* `[begin, eop)`. The buffer reserves the freedive-region size on top so  */
/* session splicing never reallocates.                                     */
pub fn linearize(data: &[u8], layout: &RingLayout) -> Result<Vec<u8>> {
    if layout.end > data.len() || layout.freedive_end > data.len() {
        return Err(Error::DataFormat("dump smaller than ring layout"));
    }

    let eop = read_eop(data, layout)?;

    let mut linear = Vec::with_capacity(layout.profile_size() + layout.freedive_size());
    linear.extend_from_slice(&data[eop..layout.end]);
    linear.extend_from_slice(&data[layout.begin..eop]);
    Ok(linear)
}

fn read_eop(data: &[u8], layout: &RingLayout) -> Result<usize> {
    if layout.eop_offset + 2 > data.len() {
        return Err(Error::DataFormat("end-of-profile pointer out of dump"));
    }
    let eop = u16::from_le_bytes([data[layout.eop_offset], data[layout.eop_offset + 1]]) as usize;
    if eop < layout.begin || eop >= layout.end {
        return Err(Error::DataFormat("end-of-profile pointer out of range"));
    }
    Ok(eop)
}

/* Walk the linearized profile region newest to oldest and hand each dive
 * block to `callback` as `(blob, fingerprint)`.
 *
 * Each block ends with a little-endian length word covering the whole
 * block. The walk stops silently at an unwritten block (mode 0xFF), at a
 * length that disagrees with the size computed from the header's sample
 * count, at a fingerprint match, or when the callback declines more. The
 * newest freedive session has no samples in the ring; its zero-delimited
 * sample sub-sequences are spliced in from the scratch region. */
pub fn extract_dives(
    data: &[u8],
    layout: &RingLayout,
    fingerprint: Option<&[u8]>,
    callback: &mut dyn FnMut(&[u8], &[u8]) -> bool,
) -> Result<()> {
    let linear = linearize(data, layout)?;
    let freedives = &data[layout.freedive_begin..layout.freedive_end];

    let mut pos = linear.len();
    let mut newest_freedive = true;
    let mut scratch = Vec::new();

    while pos >= layout.header_size + 2 {
        let length = u16::from_le_bytes([linear[pos - 2], linear[pos - 1]]) as usize;
        if length < layout.header_size + 2 || length > pos {
            debug!("dive walk stopped: implausible block length {length}");
            break;
        }

        let header = &linear[pos - length..pos - length + layout.header_size];
        let mode = header[0];
        if mode == UNWRITTEN {
            break;
        }

        let nsamples = u16::from_le_bytes([
            header[layout.nsamples_offset],
            header[layout.nsamples_offset + 1],
        ]) as usize;

        let is_freedive = layout.freedive_mode == Some(mode);
        let expected = if is_freedive {
            /* Freedive sessions store only their logbook header here. */
            layout.header_size + 2
        } else {
            layout.header_size + nsamples * layout.sample_size + 2
        };
        if length != expected {
            debug!("dive walk stopped: length {length} != computed {expected}");
            break;
        }

        let block = &linear[pos - length..pos - 2];
        let fp = &block[layout.fingerprint_offset..layout.fingerprint_offset + layout.fingerprint_size];
        if let Some(stored) = fingerprint {
            if !stored.is_empty() && stored == fp {
                break;
            }
        }

        let keep_going = if is_freedive && newest_freedive {
            newest_freedive = false;
            scratch.clear();
            scratch.extend_from_slice(block);
            append_freedive_sessions(&mut scratch, freedives, nsamples);
            let fp_range = layout.fingerprint_offset..layout.fingerprint_offset + layout.fingerprint_size;
            let fp = scratch[fp_range].to_vec();
            callback(&scratch, &fp)
        } else {
            callback(block, fp)
        };
        if !keep_going {
            break;
        }

        pos -= length;
    }
    Ok(())
}

/* Append the first `count` zero-terminated sub-sequences of the freedive
 * scratch region, terminators included. */
fn append_freedive_sessions(out: &mut Vec<u8>, region: &[u8], count: usize) {
    let mut taken = 0;
    let mut start = 0;
    for (i, &byte) in region.iter().enumerate() {
        if byte == 0 {
            out.extend_from_slice(&region[start..=i]);
            start = i + 1;
            taken += 1;
            if taken == count {
                break;
            }
        }
    }
}

/* Walk a marker-delimited circular region newest to oldest.
 *
 * Dives are stored in write order, each terminated by `marker`; `eop` is
 * the write head, one past the newest terminator. Boundaries are the
 * terminators plus the write head itself (a full ring wraps onto its own
 * tail). The chunk before the oldest terminator is delivered last, with
 * any unwritten filler preceding it stripped. */
pub fn marker_extract(
    data: &[u8],
    begin: usize,
    end: usize,
    eop: usize,
    marker: u8,
    callback: &mut dyn FnMut(&[u8]) -> bool,
) -> Result<()> {
    if end > data.len() || begin >= end {
        return Err(Error::DataFormat("marker region out of dump"));
    }
    if eop < begin || eop >= end {
        return Err(Error::DataFormat("end-of-profile pointer out of range"));
    }

    /* Rotate so the newest byte sits last. */
    let mut linear = Vec::with_capacity(end - begin);
    linear.extend_from_slice(&data[eop..end]);
    linear.extend_from_slice(&data[begin..eop]);

    let mut upper = linear.len();
    for p in (0..linear.len()).rev() {
        if linear[p] != marker {
            continue;
        }
        let chunk = &linear[p + 1..upper];
        upper = p;
        if chunk.is_empty() {
            continue;
        }
        if !callback(chunk) {
            return Ok(());
        }
    }

    /* The chunk before the oldest terminator: strip the unwritten filler  */
    /* that precedes it on a ring that never wrapped. On a full ring the   */
    /* chunk is the (possibly truncated) oldest dive and is delivered      */
    /* as-is.                                                              */
    let leading = &linear[..upper];
    let start = leading
        .iter()
        .position(|&b| b != UNWRITTEN)
        .unwrap_or(leading.len());
    let leading = &leading[start..];
    if !leading.is_empty() {
        callback(leading);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(total: usize) -> RingLayout {
        RingLayout {
            begin: 2,
            end: total,
            eop_offset: 0,
            freedive_begin: 0,
            freedive_end: 0,
            header_size: 8,
            sample_size: 2,
            nsamples_offset: 2,
            freedive_mode: Some(3),
            fingerprint_offset: 4,
            fingerprint_size: 4,
        }
    }

    /* Build one block: [mode, 0, nsamples_le16, fp(4)] + samples + length. */
    fn block(mode: u8, fp: u32, samples: &[u8]) -> Vec<u8> {
        let mut b = vec![mode, 0];
        b.extend_from_slice(&((samples.len() / 2) as u16).to_le_bytes());
        b.extend_from_slice(&fp.to_le_bytes());
        b.extend_from_slice(samples);
        let length = (b.len() + 2) as u16;
        b.extend_from_slice(&length.to_le_bytes());
        b
    }

    fn build_dump(blocks: &[Vec<u8>], total: usize, rotate: usize) -> Vec<u8> {
        /* Concatenated blocks, rotated within [2, total), eop after the   */
        /* last block byte.                                                */
        let body: Vec<u8> = blocks.concat();
        let size = total - 2;
        assert!(body.len() <= size);

        let mut ring = vec![UNWRITTEN; size];
        for (i, &byte) in body.iter().enumerate() {
            ring[(rotate + i) % size] = byte;
        }
        let eop = 2 + (rotate + body.len()) % size;

        let mut dump = vec![0u8; 2];
        dump[..2].copy_from_slice(&(eop as u16).to_le_bytes());
        dump.extend_from_slice(&ring);
        dump
    }

    #[test]
    fn linearize_is_rotation() {
        let lay = layout(12);
        /* Ring bytes 0..10 at offsets 2..12, eop = 7. */
        let mut dump = vec![0u8; 12];
        dump[..2].copy_from_slice(&7u16.to_le_bytes());
        for i in 0..10 {
            dump[2 + i] = i as u8;
        }
        let linear = linearize(&dump, &lay).unwrap();
        assert_eq!(linear, [5, 6, 7, 8, 9, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn eop_out_of_range_is_data_format() {
        let lay = layout(12);
        let mut dump = vec![0u8; 12];
        dump[..2].copy_from_slice(&12u16.to_le_bytes());
        assert!(matches!(
            linearize(&dump, &lay),
            Err(Error::DataFormat(_))
        ));
    }

    #[test]
    fn dives_walk_newest_to_oldest() {
        let lay = layout(64);
        let d1 = block(0, 0xAAAA_0001, &[1, 1]);
        let d2 = block(0, 0xAAAA_0002, &[2, 2, 2, 2]);
        let dump = build_dump(&[d1, d2], 64, 0);

        let mut seen = Vec::new();
        extract_dives(&dump, &lay, None, &mut |blob, fp| {
            seen.push((blob.to_vec(), fp.to_vec()));
            true
        })
        .unwrap();

        assert_eq!(seen.len(), 2);
        /* Newest (d2) first. */
        assert_eq!(seen[0].1, 0xAAAA_0002u32.to_le_bytes());
        assert_eq!(seen[1].1, 0xAAAA_0001u32.to_le_bytes());
    }

    #[test]
    fn wrapped_ring_yields_same_dives() {
        let lay = layout(64);
        let d1 = block(0, 0xBBBB_0001, &[1, 1]);
        let d2 = block(0, 0xBBBB_0002, &[2, 2, 2, 2]);

        for rotate in [0usize, 13, 40, 55] {
            let dump = build_dump(&[d1.clone(), d2.clone()], 64, rotate);
            let mut fps = Vec::new();
            extract_dives(&dump, &lay, None, &mut |_, fp| {
                fps.push(fp.to_vec());
                true
            })
            .unwrap();
            assert_eq!(fps.len(), 2, "rotation {rotate}");
            assert_eq!(fps[0], 0xBBBB_0002u32.to_le_bytes());
        }
    }

    #[test]
    fn fingerprint_stops_walk_silently() {
        let lay = layout(64);
        let d1 = block(0, 0xCCCC_0001, &[1, 1]);
        let d2 = block(0, 0xCCCC_0002, &[2, 2]);
        let d3 = block(0, 0xCCCC_0003, &[3, 3]);
        let dump = build_dump(&[d1, d2, d3], 64, 0);

        let mut fps = Vec::new();
        let stored = 0xCCCC_0002u32.to_le_bytes();
        extract_dives(&dump, &lay, Some(&stored), &mut |_, fp| {
            fps.push(fp.to_vec());
            true
        })
        .unwrap();

        /* Only the dive newer than the fingerprint is delivered. */
        assert_eq!(fps.len(), 1);
        assert_eq!(fps[0], 0xCCCC_0003u32.to_le_bytes());
    }

    #[test]
    fn callback_false_terminates() {
        let lay = layout(64);
        let d1 = block(0, 1, &[1, 1]);
        let d2 = block(0, 2, &[2, 2]);
        let dump = build_dump(&[d1, d2], 64, 0);

        let mut count = 0;
        extract_dives(&dump, &lay, None, &mut |_, _| {
            count += 1;
            false
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn freedive_session_is_spliced() {
        let mut lay = layout(64);
        lay.freedive_begin = 64;
        lay.freedive_end = 96;

        /* Session header claiming 3 sub-sequences, stored header-only. */
        let mut session = vec![3u8, 0];
        session.extend_from_slice(&3u16.to_le_bytes());
        session.extend_from_slice(&0xDDDD_0001u32.to_le_bytes());
        let length = (session.len() + 2) as u16;
        session.extend_from_slice(&length.to_le_bytes());

        let mut dump = build_dump(&[session], 64, 0);
        dump.resize(96, 0x55);
        /* Three zero-terminated sub-sequences, then leftovers. */
        dump[64..64 + 11].copy_from_slice(&[0x11, 0x12, 0x00, 0x21, 0x00, 0x31, 0x32, 0x33, 0x00, 0x41, 0x42]);

        let mut blobs = Vec::new();
        extract_dives(&dump, &lay, None, &mut |blob, _| {
            blobs.push(blob.to_vec());
            true
        })
        .unwrap();

        assert_eq!(blobs.len(), 1);
        let blob = &blobs[0];
        assert_eq!(blob[0], 3);
        /* Header (8 bytes) followed by exactly the three sub-sequences. */
        assert_eq!(
            &blob[8..],
            &[0x11, 0x12, 0x00, 0x21, 0x00, 0x31, 0x32, 0x33, 0x00]
        );
    }

    #[test]
    fn marker_walk_full_and_partial() {
        /* Partial ring: filler after dives; eop after newest marker. */
        let mut data = vec![UNWRITTEN; 16];
        let dives: &[u8] = &[10, 11, 0x80, 20, 21, 22, 0x80];
        data[..dives.len()].copy_from_slice(dives);
        let eop = dives.len();

        let mut seen = Vec::new();
        marker_extract(&data, 0, 16, eop, 0x80, &mut |chunk| {
            seen.push(chunk.to_vec());
            true
        })
        .unwrap();

        /* Newest first; the chunk [10, 11] before the oldest marker is    */
        /* delivered last.                                                 */
        assert_eq!(seen, vec![vec![20, 21, 22], vec![10, 11]]);
    }

    #[test]
    fn marker_walk_strips_unwritten_filler() {
        let mut data = vec![UNWRITTEN; 16];
        data[4..9].copy_from_slice(&[30, 31, 0x80, 40, 0x80]);
        let eop = 9;

        let mut seen = Vec::new();
        marker_extract(&data, 0, 16, eop, 0x80, &mut |chunk| {
            seen.push(chunk.to_vec());
            true
        })
        .unwrap();

        /* [40] then [30, 31]; the 0xFF filler around the data never       */
        /* reaches the callback.                                           */
        assert_eq!(seen, vec![vec![40], vec![30, 31]]);
    }

    #[test]
    fn circular_helpers() {
        assert_eq!(distance(10, 14, 8, 16), 4);
        assert_eq!(distance(14, 10, 8, 16), 4);
        assert_eq!(increment(14, 4, 8, 16), 10);
        assert_eq!(increment(10, 2, 8, 16), 12);
    }
}
