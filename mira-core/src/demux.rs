//! Elementary stream demuxer.
//!
//! Splits raw Annex-B payloads on `00 00 01` / `00 00 00 01` start codes
//! and classifies each unit by `nal_unit_type` (low 5 bits of the first
//! byte). Parameter sets rebuild the decoder's format description; key
//! and delta frames are reframed with a 4-byte big-endian length and
//! handed to the [`DecodePipeline`].

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::events::{DecodePipeline, FormatDescription, VideoFrame};

// ── NalKind ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalKind {
    /// Sequence parameter set (type 7).
    ParameterSetA,
    /// Picture parameter set (type 8).
    ParameterSetB,
    /// IDR slice (type 5).
    KeyFrame,
    /// Non-IDR slice (type 1).
    DeltaFrame,
    /// Anything else; ignored.
    Other(u8),
}

impl NalKind {
    pub fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            7 => NalKind::ParameterSetA,
            8 => NalKind::ParameterSetB,
            5 => NalKind::KeyFrame,
            1 => NalKind::DeltaFrame,
            other => NalKind::Other(other),
        }
    }

    pub fn nal_type(self) -> u8 {
        match self {
            NalKind::ParameterSetA => 7,
            NalKind::ParameterSetB => 8,
            NalKind::KeyFrame => 5,
            NalKind::DeltaFrame => 1,
            NalKind::Other(t) => t,
        }
    }
}

// ── AccessUnit ───────────────────────────────────────────────────

/// One unit cut from the stream, without its start code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub kind: NalKind,
    pub payload: Bytes,
}

impl AccessUnit {
    /// Payload prefixed with its length as a big-endian `u32`.
    pub fn length_prefixed(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(4 + self.payload.len());
        out.put_u32(self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}

/// Cut `buf` into units. Bytes before the first start code are skipped.
pub fn split_units(buf: &[u8]) -> Vec<AccessUnit> {
    // (start of code, start of payload)
    let mut codes: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            let floor = codes.last().map_or(0, |&(_, payload)| payload);
            let start = if i > floor && buf[i - 1] == 0 { i - 1 } else { i };
            codes.push((start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(codes.len());
    for (idx, &(_, payload_start)) in codes.iter().enumerate() {
        let end = codes.get(idx + 1).map_or(buf.len(), |&(next, _)| next);
        if end <= payload_start {
            continue;
        }
        let payload = Bytes::copy_from_slice(&buf[payload_start..end]);
        units.push(AccessUnit {
            kind: NalKind::from_header(payload[0]),
            payload,
        });
    }
    units
}

// ── DemuxStats ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    /// Frames handed to the pipeline.
    pub frames: u64,
    /// Frames dropped for lack of a decode session or a key frame.
    pub dropped: u64,
    /// Units of unsupported type.
    pub ignored: u64,
    /// Format descriptions rebuilt.
    pub format_rebuilds: u64,
}

// ── Demuxer ──────────────────────────────────────────────────────

/// Stateful demuxer fed one datagram payload at a time.
pub struct Demuxer {
    pipeline: Arc<dyn DecodePipeline>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
    format_dirty: bool,
    awaiting_key_frame: bool,
    stats: DemuxStats,
}

impl Demuxer {
    pub fn new(pipeline: Arc<dyn DecodePipeline>) -> Self {
        Self {
            pipeline,
            sps: None,
            pps: None,
            format_dirty: false,
            awaiting_key_frame: true,
            stats: DemuxStats::default(),
        }
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    /// Process one payload. Returns the units found in it.
    pub fn push(&mut self, payload: &[u8]) -> Vec<AccessUnit> {
        let units = split_units(payload);
        if units.is_empty() && !payload.is_empty() {
            debug!(len = payload.len(), "payload without start code");
        }

        for unit in &units {
            match unit.kind {
                NalKind::ParameterSetA => {
                    self.sps = Some(unit.payload.clone());
                    self.pps = None;
                    self.format_dirty = true;
                }
                // Folded into the rebuild the preceding SPS started.
                NalKind::ParameterSetB => self.pps = Some(unit.payload.clone()),
                NalKind::KeyFrame | NalKind::DeltaFrame => self.forward(unit),
                NalKind::Other(t) => {
                    self.stats.ignored += 1;
                    debug!(nal_type = t, len = unit.payload.len(), "ignoring unit");
                }
            }
        }
        if self.pps.is_some() {
            self.flush_format();
        }

        units
    }

    fn forward(&mut self, unit: &AccessUnit) {
        // A frame forces the rebuild even if the PPS never came.
        self.flush_format();
        let key_frame = unit.kind == NalKind::KeyFrame;

        if !self.pipeline.has_session() {
            self.stats.dropped += 1;
            warn!(nal_type = unit.kind.nal_type(), "no decode session; frame dropped");
            return;
        }
        if !key_frame && self.awaiting_key_frame {
            self.stats.dropped += 1;
            debug!("delta frame before key frame; dropped");
            return;
        }

        self.awaiting_key_frame = false;
        self.stats.frames += 1;
        self.pipeline.submit(VideoFrame {
            key_frame,
            data: unit.length_prefixed(),
        });
    }

    fn flush_format(&mut self) {
        if !self.format_dirty {
            return;
        }
        let Some(sps) = self.sps.clone() else {
            return;
        };
        self.format_dirty = false;
        self.awaiting_key_frame = true;
        self.stats.format_rebuilds += 1;
        info!(sps_len = sps.len(), has_pps = self.pps.is_some(), "rebuilding format description");
        self.pipeline.configure(&FormatDescription {
            sps,
            pps: self.pps.clone(),
        });
    }
}

// ── Tests ────────────────────────────────────────────────────────
