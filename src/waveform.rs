//! Binary waveform block decoding.
//!
//! Oscilloscopes return curve data as an IEEE 488.2 definite-length arbitrary
//! block:
//!
//! ```text
//! #<d><nbytes: d ASCII digits><payload: nbytes bytes>[terminator]
//! ```
//!
//! The payload is a sequence of big-endian signed 16-bit ADC codes. Each code is
//! mapped to volts with the scaling parameters reported for the *same* capture:
//!
//! ```text
//! v[i] = (code[i] - yoff) * ymult + yzero
//! t[i] = i * xincr
//! ```

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use crate::error::{CalError, CalResult};

/// Marker byte that opens a definite-length block.
pub const BLOCK_MARKER: u8 = b'#';

/// Bytes per sample for 16-bit (`DATA:WIDTH 2`) transfers.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Raw bytes returned by the instrument for one trigger event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCapture(Bytes);

impl RawCapture {
    /// Wrap the bytes of one block read.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Underlying bytes, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Total length of the capture in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the instrument returned nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Waveform preamble values that convert ADC codes to physical units.
///
/// Must be read from the same acquisition as the block they scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleParameters {
    /// Volts per ADC code (`WFMPRE:YMULT?`).
    pub ymult: f64,
    /// ADC code offset (`WFMPRE:YOFF?`).
    pub yoff: f64,
    /// Voltage reference added after scaling (`WFMPRE:YZERO?`).
    pub yzero: f64,
    /// Seconds between samples (`WFMPRE:XINCR?`).
    pub xincr: f64,
}

impl ScaleParameters {
    /// Convert one ADC code to volts.
    pub fn to_volts(&self, code: i16) -> f64 {
        (f64::from(code) - self.yoff) * self.ymult + self.yzero
    }
}

/// A decoded (time, voltage) waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    sample_interval: f64,
    volts: Vec<f64>,
}

impl Trace {
    /// Build a trace from voltages sampled every `sample_interval` seconds.
    pub fn new(sample_interval: f64, volts: Vec<f64>) -> Self {
        Self {
            sample_interval,
            volts,
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.volts.len()
    }

    /// True for a zero-length trace.
    pub fn is_empty(&self) -> bool {
        self.volts.is_empty()
    }

    /// Seconds between consecutive samples.
    pub fn sample_interval(&self) -> f64 {
        self.sample_interval
    }

    /// Voltages in acquisition order.
    pub fn volts(&self) -> &[f64] {
        &self.volts
    }

    /// Time of sample `index`, measured from the first sample.
    pub fn time_at(&self, index: usize) -> f64 {
        index as f64 * self.sample_interval
    }

    /// Iterate over `(time, voltage)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.volts
            .iter()
            .enumerate()
            .map(|(i, &v)| (self.time_at(i), v))
    }
}

/// Locate the payload of a definite-length block.
///
/// Trailing bytes after the payload (usually a line terminator) are ignored.
pub fn block_payload(raw: &[u8]) -> CalResult<&[u8]> {
    match raw.first() {
        Some(&BLOCK_MARKER) => {}
        Some(other) => {
            return Err(CalError::MalformedBlock(format!(
                "expected '#' marker, found byte 0x{other:02x}"
            )))
        }
        None => return Err(CalError::MalformedBlock("empty capture".into())),
    }

    let digits = raw
        .get(1)
        .filter(|b| b.is_ascii_digit())
        .map(|b| usize::from(b - b'0'))
        .ok_or_else(|| CalError::MalformedBlock("missing header length digit".into()))?;
    if digits == 0 {
        return Err(CalError::MalformedBlock(
            "indefinite-length blocks are not supported".into(),
        ));
    }

    let count_field = raw.get(2..2 + digits).ok_or_else(|| {
        CalError::MalformedBlock(format!("header truncated, expected {digits} count digits"))
    })?;
    let nbytes: usize = std::str::from_utf8(count_field)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CalError::MalformedBlock(format!(
                "invalid byte count field {:?}",
                String::from_utf8_lossy(count_field)
            ))
        })?;

    let start = 2 + digits;
    raw.get(start..start + nbytes).ok_or_else(|| {
        CalError::MalformedBlock(format!(
            "payload truncated: header announces {nbytes} bytes, {} present",
            raw.len() - start
        ))
    })
}

/// Decode a raw capture into a voltage trace.
pub fn decode_block(raw: &RawCapture, scale: &ScaleParameters) -> CalResult<Trace> {
    let payload = block_payload(raw.as_bytes())?;
    if payload.len() % BYTES_PER_SAMPLE != 0 {
        return Err(CalError::MalformedBlock(format!(
            "payload length {} is not a multiple of {BYTES_PER_SAMPLE}",
            payload.len()
        )));
    }

    let mut buf = payload;
    let mut volts = Vec::with_capacity(payload.len() / BYTES_PER_SAMPLE);
    while buf.has_remaining() {
        volts.push(scale.to_volts(buf.get_i16()));
    }
    Ok(Trace::new(scale.xincr, volts))
}

/// Encode ADC codes as a definite-length block with a trailing newline.
///
/// Used by the simulated scope and by tests.
pub fn encode_block(codes: &[i16]) -> RawCapture {
    let payload_len = codes.len() * BYTES_PER_SAMPLE;
    let count = payload_len.to_string();
    let mut out = Vec::with_capacity(payload_len + count.len() + 3);
    out.push(BLOCK_MARKER);
    out.extend_from_slice(count.len().to_string().as_bytes());
    out.extend_from_slice(count.as_bytes());
    for code in codes {
        out.extend_from_slice(&code.to_be_bytes());
    }
    out.push(b'\n');
    RawCapture::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_scale() -> ScaleParameters {
        ScaleParameters {
            ymult: 1.0,
            yoff: 0.0,
            yzero: 0.0,
            xincr: 1.0,
        }
    }

    #[test]
    fn test_sample_count_matches_payload() {
        for k in [0usize, 1, 7, 2000] {
            let codes: Vec<i16> = (0..k).map(|i| (i as i16).wrapping_mul(37)).collect();
            let trace = decode_block(&encode_block(&codes), &unit_scale()).unwrap();
            assert_eq!(trace.len(), k);
        }
    }

    #[test]
    fn test_voltage_formula() {
        let scale = ScaleParameters {
            ymult: 0.25,
            yoff: 4.0,
            yzero: -1.5,
            xincr: 4e-10,
        };
        let codes = [-32768i16, -1, 0, 3, 32767];
        let trace = decode_block(&encode_block(&codes), &scale).unwrap();
        for (code, v) in codes.iter().zip(trace.volts()) {
            assert_eq!(*v, (f64::from(*code) - 4.0) * 0.25 + -1.5);
        }
        assert_eq!(trace.time_at(3), 3.0 * 4e-10);
        assert_eq!(trace.sample_interval(), 4e-10);
    }

    #[test]
    fn test_big_endian_signed() {
        // 0xFF 0xFE is -2 big-endian
        let raw = RawCapture::new(b"#14\xff\xfe\x01\x00".to_vec());
        let trace = decode_block(&raw, &unit_scale()).unwrap();
        assert_eq!(trace.volts(), &[-2.0, 256.0]);
    }

    #[test]
    fn test_trailing_terminator_ignored() {
        let raw = RawCapture::new(b"#12\x00\x05\n".to_vec());
        let trace = decode_block(&raw, &unit_scale()).unwrap();
        assert_eq!(trace.volts(), &[5.0]);
    }

    #[test]
    fn test_rejects_missing_marker() {
        let raw = RawCapture::new(b"14\x00\x01\x00\x02".to_vec());
        assert!(matches!(
            decode_block(&raw, &unit_scale()),
            Err(CalError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_rejects_odd_payload() {
        let raw = RawCapture::new(b"#13\x00\x01\x02".to_vec());
        assert!(matches!(
            decode_block(&raw, &unit_scale()),
            Err(CalError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_rejects_bad_headers() {
        let cases: [&[u8]; 7] = [
            b"",
            b"#",
            b"#x4\x00\x01",
            b"#0",
            b"#2",
            b"#2a4\x00\x01\x00\x02",
            b"#18\x00\x01",
        ];
        for bad in cases {
            let raw = RawCapture::new(bad.to_vec());
            assert!(
                matches!(decode_block(&raw, &unit_scale()), Err(CalError::MalformedBlock(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_points_iterator() {
        let trace = Trace::new(0.5, vec![1.0, 2.0, 3.0]);
        let points: Vec<_> = trace.points().collect();
        assert_eq!(points, vec![(0.0, 1.0), (0.5, 2.0), (1.0, 3.0)]);
    }
}
