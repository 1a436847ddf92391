//! Synthetic JPEG header for bridges that stream bare scan data.
//!
//! Some bridge/sensor pairs emit a start-of-image marker followed by a
//! short private header and the entropy-coded scan, with no quantization
//! or Huffman tables. Decoders need a full baseline header, so one is
//! built here from the sensor's quantization tables, the stream quality
//! and the frame geometry.

use serde::Deserialize;
use thiserror::Error;

pub const SOI: [u8; 2] = [0xff, 0xd8];

const DQT: u8 = 0xdb;
const SOF0: u8 = 0xc0;
const DHT: u8 = 0xc4;
const SOS: u8 = 0xda;

/// Zigzag position -> natural (row-major) coefficient index.
const ZIGZAG: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27,
    20, 13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58,
    59, 52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

const STD_LUMA_QUANT: [u8; 64] = [
    16, 11, 10, 16, 24, 40, 51, 61, //
    12, 12, 14, 19, 26, 58, 60, 55, //
    14, 13, 16, 24, 40, 57, 69, 56, //
    14, 17, 22, 29, 51, 87, 80, 62, //
    18, 22, 37, 56, 68, 109, 103, 77, //
    24, 35, 55, 64, 81, 104, 113, 92, //
    49, 64, 78, 87, 103, 121, 120, 101, //
    72, 92, 95, 98, 112, 100, 103, 99,
];

const STD_CHROMA_QUANT: [u8; 64] = [
    17, 18, 24, 47, 99, 99, 99, 99, //
    18, 21, 26, 66, 99, 99, 99, 99, //
    24, 26, 56, 99, 99, 99, 99, 99, //
    47, 66, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99, //
    99, 99, 99, 99, 99, 99, 99, 99,
];

// Standard Huffman tables (ITU T.81 Annex K.3).
const DC_LUMA_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
const DC_CHROMA_BITS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
const DC_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

const AC_LUMA_BITS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
const AC_LUMA_VALUES: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08, 0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52, 0xd1, 0xf0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7,
    0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5,
    0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2,
    0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

const AC_CHROMA_BITS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
const AC_CHROMA_VALUES: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33, 0x52, 0xf0,
    0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34, 0xe1, 0x25, 0xf1, 0x17, 0x18, 0x19, 0x1a, 0x26,
    0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5,
    0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3,
    0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda,
    0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8,
    0xf9, 0xfa,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JpegError {
    #[error("quantization blob must be 128 bytes (luma then chroma), got {0}")]
    QuantLength(usize),
    #[error("quality {0} out of range 1..=100")]
    Quality(u8),
}

/// Luma and chroma quantization tables, natural (row-major) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantTables {
    pub luma: [u8; 64],
    pub chroma: [u8; 64],
}

impl Default for QuantTables {
    fn default() -> Self {
        Self {
            luma: STD_LUMA_QUANT,
            chroma: STD_CHROMA_QUANT,
        }
    }
}

impl QuantTables {
    /// Split a 128-byte blob into luma and chroma tables.
    pub fn from_blob(blob: &[u8]) -> Result<Self, JpegError> {
        if blob.len() != 128 {
            return Err(JpegError::QuantLength(blob.len()));
        }
        let mut tables = Self::default();
        tables.luma.copy_from_slice(&blob[..64]);
        tables.chroma.copy_from_slice(&blob[64..]);
        Ok(tables)
    }

    /// IJG quality scaling; 50 leaves the tables unchanged.
    pub fn scaled(&self, quality: u8) -> Result<Self, JpegError> {
        if !(1..=100).contains(&quality) {
            return Err(JpegError::Quality(quality));
        }
        let q = quality as u32;
        let scale = if q < 50 { 5000 / q } else { 200 - q * 2 };
        let apply = |table: &[u8; 64]| {
            let mut out = [0u8; 64];
            for (o, &base) in out.iter_mut().zip(table.iter()) {
                *o = ((base as u32 * scale + 50) / 100).clamp(1, 255) as u8;
            }
            out
        };
        Ok(Self {
            luma: apply(&self.luma),
            chroma: apply(&self.chroma),
        })
    }
}

impl<'de> Deserialize<'de> for QuantTables {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let blob = Vec::<u8>::deserialize(de)?;
        QuantTables::from_blob(&blob).map_err(serde::de::Error::custom)
    }
}

/// Chroma subsampling of the hardware scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsampling {
    #[default]
    Yuv422,
    Yuv420,
}

impl Subsampling {
    fn luma_factor(self) -> u8 {
        match self {
            Subsampling::Yuv422 => 0x21,
            Subsampling::Yuv420 => 0x22,
        }
    }
}

/// Parameters for one synthetic header.
#[derive(Debug, Clone)]
pub struct HeaderParams {
    pub width: u16,
    pub height: u16,
    pub quality: u8,
    pub subsampling: Subsampling,
    pub quant: QuantTables,
}

/// Build SOI, DQT, SOF0, DHT and SOS. The scan data follows directly.
pub fn build_header(params: &HeaderParams) -> Result<Vec<u8>, JpegError> {
    let quant = params.quant.scaled(params.quality)?;
    let mut out = Vec::with_capacity(600);
    out.extend_from_slice(&SOI);

    let mut dqt = Vec::with_capacity(130);
    for (id, table) in [(0u8, &quant.luma), (1u8, &quant.chroma)] {
        dqt.push(id);
        dqt.extend(ZIGZAG.iter().map(|&i| table[i]));
    }
    segment(&mut out, DQT, &dqt);

    let [h_hi, h_lo] = params.height.to_be_bytes();
    let [w_hi, w_lo] = params.width.to_be_bytes();
    let sof = [
        8, h_hi, h_lo, w_hi, w_lo, 3, //
        1, params.subsampling.luma_factor(), 0, //
        2, 0x11, 1, //
        3, 0x11, 1,
    ];
    segment(&mut out, SOF0, &sof);

    let mut dht = Vec::with_capacity(416);
    for (class_id, bits, values) in [
        (0x00u8, &DC_LUMA_BITS, &DC_VALUES[..]),
        (0x10, &AC_LUMA_BITS, &AC_LUMA_VALUES[..]),
        (0x01, &DC_CHROMA_BITS, &DC_VALUES[..]),
        (0x11, &AC_CHROMA_BITS, &AC_CHROMA_VALUES[..]),
    ] {
        dht.push(class_id);
        dht.extend_from_slice(bits);
        dht.extend_from_slice(values);
    }
    segment(&mut out, DHT, &dht);

    segment(&mut out, SOS, &[3, 1, 0x00, 2, 0x11, 3, 0x11, 0, 0x3f, 0]);
    Ok(out)
}

fn segment(out: &mut Vec<u8>, marker: u8, body: &[u8]) {
    out.extend_from_slice(&[0xff, marker]);
    out.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> HeaderParams {
        HeaderParams {
            width: 640,
            height: 480,
            quality: 50,
            subsampling: Subsampling::Yuv422,
            quant: QuantTables::default(),
        }
    }

    /// Walk the marker segments after SOI.
    fn segments(header: &[u8]) -> Vec<(u8, &[u8])> {
        let mut out = Vec::new();
        let mut pos = 2;
        while pos + 4 <= header.len() {
            assert_eq!(header[pos], 0xff);
            let marker = header[pos + 1];
            let len = u16::from_be_bytes([header[pos + 2], header[pos + 3]]) as usize;
            out.push((marker, &header[pos + 4..pos + 2 + len]));
            pos += 2 + len;
        }
        assert_eq!(pos, header.len());
        out
    }

    #[test]
    fn test_header_layout() {
        let header = build_header(&params()).unwrap();
        assert_eq!(&header[..2], &SOI);
        assert_eq!(header.len(), 589);

        let segs = segments(&header);
        let markers: Vec<u8> = segs.iter().map(|(m, _)| *m).collect();
        assert_eq!(markers, vec![DQT, SOF0, DHT, SOS]);

        let sof = segs[1].1;
        assert_eq!(u16::from_be_bytes([sof[1], sof[2]]), 480);
        assert_eq!(u16::from_be_bytes([sof[3], sof[4]]), 640);
        assert_eq!(sof[7], 0x21);
    }

    #[test]
    fn test_dqt_is_zigzag_ordered() {
        let header = build_header(&params()).unwrap();
        let dqt = segments(&header)[0].1;
        assert_eq!(dqt[0], 0);
        // zigzag positions 0, 1, 2 map to natural 0, 1, 8
        assert_eq!(&dqt[1..4], &[16, 11, 12]);
        assert_eq!(dqt[65], 1);
        assert_eq!(dqt[66], 17);
    }

    #[test]
    fn test_quality_scaling() {
        let base = QuantTables::default();
        assert_eq!(base.scaled(50).unwrap(), base);
        let best = base.scaled(100).unwrap();
        assert!(best.luma.iter().chain(best.chroma.iter()).all(|&v| v == 1));
        let worst = base.scaled(1).unwrap();
        assert!(worst.chroma.iter().all(|&v| v == 255));
        assert_eq!(base.scaled(0), Err(JpegError::Quality(0)));
    }

    #[test]
    fn test_huffman_counts_match_values() {
        for (bits, len) in [
            (&DC_LUMA_BITS, DC_VALUES.len()),
            (&DC_CHROMA_BITS, DC_VALUES.len()),
            (&AC_LUMA_BITS, AC_LUMA_VALUES.len()),
            (&AC_CHROMA_BITS, AC_CHROMA_VALUES.len()),
        ] {
            assert_eq!(bits.iter().map(|&b| b as usize).sum::<usize>(), len);
        }
    }

    #[test]
    fn test_quant_blob_length() {
        assert_eq!(QuantTables::from_blob(&[1; 10]), Err(JpegError::QuantLength(10)));
        let tables = QuantTables::from_blob(&[7; 128]).unwrap();
        assert_eq!(tables.luma, [7; 64]);
    }
}
