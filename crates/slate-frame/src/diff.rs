use serde::{Deserialize, Serialize};

use crate::store::Frame;

/// One changed rectangle of a framebuffer.
///
/// `y`/`height` are rows; `x`/`width` are byte columns within a row (for
/// bit-packed displays one byte column covers several pixels). `bytes` holds
/// the region content row-major, `width` bytes per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl Region {
    pub fn area_bytes(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// A partial-refresh delta between two same-shape framebuffers. Applying it
/// to the previous buffer reproduces the next buffer byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDelta {
    /// Bytes per framebuffer row.
    pub row_stride: u32,
    /// Total rows in the framebuffer.
    pub rows: u32,
    pub regions: Vec<Region>,
}

impl FrameDelta {
    /// Reconstruct the next framebuffer from the previous one.
    pub fn apply(&self, previous: &[u8]) -> Vec<u8> {
        let stride = self.row_stride as usize;
        let mut out = previous.to_vec();
        for region in &self.regions {
            let width = region.width as usize;
            for row_offset in 0..region.height as usize {
                let row = region.y as usize + row_offset;
                let dst = row * stride + region.x as usize;
                let src = row_offset * width;
                out[dst..dst + width].copy_from_slice(&region.bytes[src..src + width]);
            }
        }
        out
    }

    pub fn changed_bytes(&self) -> usize {
        self.regions.iter().map(Region::area_bytes).sum()
    }
}

/// How a pending frame should be delivered to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Send the whole frame. Used when the device cannot partially refresh,
    /// there is nothing to diff against, shapes differ, or the delta would
    /// not be smaller than the frame itself.
    Full,
    Partial(FrameDelta),
}

impl RefreshPlan {
    pub fn plan(previous: Option<&Frame>, next: &Frame, partial_refresh: bool) -> RefreshPlan {
        if !partial_refresh {
            return RefreshPlan::Full;
        }
        let Some(previous) = previous else {
            return RefreshPlan::Full;
        };
        if previous.width != next.width || previous.height != next.height {
            return RefreshPlan::Full;
        }
        match diff_buffers(&previous.bytes, &next.bytes, next.height) {
            Some(delta) if delta.changed_bytes() < next.bytes.len() => {
                RefreshPlan::Partial(delta)
            }
            _ => RefreshPlan::Full,
        }
    }
}

/// Compute the changed regions between two framebuffers of identical shape.
///
/// Pure function of the two byte buffers. Scans row by row, groups runs of
/// consecutive dirty rows into bands, and trims each band to the changed
/// byte-column range. Returns `None` when the buffers cannot be compared
/// (length mismatch, zero or non-dividing row count).
pub fn diff_buffers(previous: &[u8], next: &[u8], rows: u32) -> Option<FrameDelta> {
    if previous.len() != next.len() || next.is_empty() {
        return None;
    }
    if rows == 0 || next.len() % rows as usize != 0 {
        return None;
    }
    let stride = next.len() / rows as usize;

    let mut regions = Vec::new();
    let mut band: Option<Band> = None;

    for row in 0..rows as usize {
        let offset = row * stride;
        let prev_row = &previous[offset..offset + stride];
        let next_row = &next[offset..offset + stride];
        match dirty_span(prev_row, next_row) {
            Some((start, end)) => {
                band = Some(match band.take() {
                    Some(mut open) => {
                        open.rows += 1;
                        open.start = open.start.min(start);
                        open.end = open.end.max(end);
                        open
                    }
                    None => Band {
                        top: row,
                        rows: 1,
                        start,
                        end,
                    },
                });
            }
            None => {
                if let Some(open) = band.take() {
                    regions.push(open.into_region(next, stride));
                }
            }
        }
    }
    if let Some(open) = band.take() {
        regions.push(open.into_region(next, stride));
    }

    Some(FrameDelta {
        row_stride: stride as u32,
        rows,
        regions,
    })
}

/// Changed byte range `[start, end)` within a row, if any.
fn dirty_span(previous: &[u8], next: &[u8]) -> Option<(usize, usize)> {
    let start = previous
        .iter()
        .zip(next)
        .position(|(a, b)| a != b)?;
    let tail = previous
        .iter()
        .zip(next)
        .rev()
        .position(|(a, b)| a != b)
        .unwrap_or(0);
    Some((start, next.len() - tail))
}

struct Band {
    top: usize,
    rows: usize,
    start: usize,
    end: usize,
}

impl Band {
    fn into_region(self, next: &[u8], stride: usize) -> Region {
        let width = self.end - self.start;
        let mut bytes = Vec::with_capacity(width * self.rows);
        for row in self.top..self.top + self.rows {
            let offset = row * stride + self.start;
            bytes.extend_from_slice(&next[offset..offset + width]);
        }
        Region {
            x: self.start as u32,
            y: self.top as u32,
            width: width as u32,
            height: self.rows as u32,
            bytes,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn frame(instance: &str, bytes: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            frame_id: format!("frm_{instance}"),
            instance_id: instance.to_string(),
            width,
            height,
            hash: crate::content_hash(&bytes),
            bytes,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn delta_round_trips() {
        let prev = vec![0u8; 64];
        let mut next = prev.clone();
        next[0] = 1;
        next[13] = 7;
        next[63] = 255;
        let delta = diff_buffers(&prev, &next, 8).unwrap();
        assert_eq!(delta.apply(&prev), next);
    }

    #[test]
    fn identical_buffers_produce_empty_delta() {
        let buf = vec![42u8; 32];
        let delta = diff_buffers(&buf, &buf, 4).unwrap();
        assert!(delta.regions.is_empty());
        assert_eq!(delta.apply(&buf), buf);
    }

    #[test]
    fn localized_change_yields_single_tight_region() {
        // 200x100 single-byte-per-pixel frame, one 100x50 dirty window.
        let width = 200usize;
        let rows = 100u32;
        let prev = vec![0u8; width * rows as usize];
        let mut next = prev.clone();
        for row in 25..75 {
            for col in 40..140 {
                next[row * width + col] = 0xF0;
            }
        }
        let delta = diff_buffers(&prev, &next, rows).unwrap();
        assert_eq!(delta.regions.len(), 1);
        let region = &delta.regions[0];
        assert_eq!((region.x, region.y), (40, 25));
        assert_eq!((region.width, region.height), (100, 50));
        assert_eq!(delta.apply(&prev), next);
    }

    #[test]
    fn disjoint_bands_become_separate_regions() {
        let stride = 10usize;
        let prev = vec![0u8; stride * 10];
        let mut next = prev.clone();
        next[1 * stride + 2] = 1; // row 1
        next[7 * stride + 8] = 1; // row 7
        let delta = diff_buffers(&prev, &next, 10).unwrap();
        assert_eq!(delta.regions.len(), 2);
        assert_eq!(delta.apply(&prev), next);
    }

    #[test]
    fn shape_mismatch_is_not_diffable() {
        assert!(diff_buffers(&[0; 8], &[0; 16], 4).is_none());
        assert!(diff_buffers(&[0; 8], &[0; 8], 0).is_none());
        assert!(diff_buffers(&[0; 8], &[0; 8], 3).is_none());
        assert!(diff_buffers(&[], &[], 1).is_none());
    }

    #[test]
    fn plan_falls_back_to_full_without_capability() {
        let prev = frame("a", vec![0u8; 16], 4, 4);
        let next = frame("a", vec![1u8; 16], 4, 4);
        assert_eq!(RefreshPlan::plan(Some(&prev), &next, false), RefreshPlan::Full);
    }

    #[test]
    fn plan_falls_back_to_full_without_previous() {
        let next = frame("a", vec![1u8; 16], 4, 4);
        assert_eq!(RefreshPlan::plan(None, &next, true), RefreshPlan::Full);
    }

    #[test]
    fn plan_falls_back_to_full_on_dimension_change() {
        let prev = frame("a", vec![0u8; 16], 4, 4);
        let next = frame("a", vec![0u8; 32], 4, 8);
        assert_eq!(RefreshPlan::plan(Some(&prev), &next, true), RefreshPlan::Full);
    }

    #[test]
    fn plan_prefers_full_when_everything_changed() {
        let prev = frame("a", vec![0u8; 16], 4, 4);
        let next = frame("a", vec![9u8; 16], 4, 4);
        assert_eq!(RefreshPlan::plan(Some(&prev), &next, true), RefreshPlan::Full);
    }

    #[test]
    fn plan_produces_partial_for_small_change() {
        let prev = frame("a", vec![0u8; 64], 8, 8);
        let mut bytes = vec![0u8; 64];
        bytes[20] = 5;
        let next = frame("a", bytes.clone(), 8, 8);
        match RefreshPlan::plan(Some(&prev), &next, true) {
            RefreshPlan::Partial(delta) => {
                assert_eq!(delta.apply(&prev.bytes), bytes);
                assert!(delta.changed_bytes() < 64);
            }
            RefreshPlan::Full => panic!("expected a partial plan"),
        }
    }

    #[test]
    fn region_bytes_serialize_as_base64() {
        let region = Region {
            x: 0,
            y: 0,
            width: 3,
            height: 1,
            bytes: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&region).unwrap();
        assert_eq!(json["bytes"], "AQID");
        let back: Region = serde_json::from_value(json).unwrap();
        assert_eq!(back, region);
    }
}
