//! STL geometry: volume, bounding box and triangle count.
//!
//! Both encodings are accepted. A file is binary when its length matches the triangle count in
//! its header (`84 + 50 * n` bytes); otherwise it must be ASCII, starting with `solid`.
//! Units are assumed to be millimetres.

use rust_decimal::{Decimal, prelude::FromPrimitive};
use thiserror::Error;

const BINARY_HEADER_LEN: usize = 80;
const BINARY_TRIANGLE_LEN: usize = 50;

#[derive(Debug, Error, PartialEq)]
pub enum StlError {
    #[error("file is too short to be an STL")]
    TooShort,

    #[error("binary STL declares {declared} triangles but contains {actual} bytes")]
    TruncatedBinary { declared: u32, actual: usize },

    #[error("ASCII STL parse error: {0}")]
    InvalidAscii(String),

    #[error("STL contains no triangles")]
    Empty,

    #[error("STL contains non-finite coordinates")]
    NonFinite,
}

/// Geometry of a mesh, in millimetres and cubic centimetres.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshStats {
    pub volume_cm3: f64,
    pub bbox_mm: [f64; 3],
    pub triangle_count: u64,
}

impl MeshStats {
    pub fn volume_decimal(&self) -> Option<Decimal> {
        Decimal::from_f64(self.volume_cm3).map(|v| v.round_dp(3))
    }

    pub fn bbox_decimal(&self) -> Option<[Decimal; 3]> {
        let [x, y, z] = self.bbox_mm;
        Some([
            Decimal::from_f64(x)?.round_dp(2),
            Decimal::from_f64(y)?.round_dp(2),
            Decimal::from_f64(z)?.round_dp(2),
        ])
    }
}

type Triangle = [[f64; 3]; 3];

/// Accumulates signed tetrahedron volumes and extents
struct Accumulator {
    signed_volume_mm3: f64,
    min: [f64; 3],
    max: [f64; 3],
    count: u64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            signed_volume_mm3: 0.0,
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
            count: 0,
        }
    }

    fn push(&mut self, [a, b, c]: Triangle) -> Result<(), StlError> {
        if a.iter().chain(&b).chain(&c).any(|v| !v.is_finite()) {
            return Err(StlError::NonFinite);
        }

        // a · (b × c) / 6
        let cross = [
            b[1] * c[2] - b[2] * c[1],
            b[2] * c[0] - b[0] * c[2],
            b[0] * c[1] - b[1] * c[0],
        ];
        self.signed_volume_mm3 += (a[0] * cross[0] + a[1] * cross[1] + a[2] * cross[2]) / 6.0;

        for vertex in [a, b, c] {
            for axis in 0..3 {
                self.min[axis] = self.min[axis].min(vertex[axis]);
                self.max[axis] = self.max[axis].max(vertex[axis]);
            }
        }
        self.count += 1;
        Ok(())
    }

    fn finish(self) -> Result<MeshStats, StlError> {
        if self.count == 0 {
            return Err(StlError::Empty);
        }
        Ok(MeshStats {
            volume_cm3: self.signed_volume_mm3.abs() / 1000.0,
            bbox_mm: [
                self.max[0] - self.min[0],
                self.max[1] - self.min[1],
                self.max[2] - self.min[2],
            ],
            triangle_count: self.count,
        })
    }
}

pub fn analyze(bytes: &[u8]) -> Result<MeshStats, StlError> {
    if bytes.len() >= BINARY_HEADER_LEN + 4 {
        let declared = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]);
        let expected = BINARY_HEADER_LEN + 4 + declared as usize * BINARY_TRIANGLE_LEN;
        if expected == bytes.len() {
            return parse_binary(&bytes[BINARY_HEADER_LEN + 4..]);
        }
        if !looks_ascii(bytes) {
            return Err(StlError::TruncatedBinary {
                declared,
                actual: bytes.len(),
            });
        }
    }

    if looks_ascii(bytes) {
        let text = std::str::from_utf8(bytes).map_err(|e| StlError::InvalidAscii(e.to_string()))?;
        return parse_ascii(text);
    }

    Err(StlError::TooShort)
}

fn looks_ascii(bytes: &[u8]) -> bool {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    bytes[start..].starts_with(b"solid")
}

fn parse_binary(body: &[u8]) -> Result<MeshStats, StlError> {
    let mut acc = Accumulator::new();
    for record in body.chunks_exact(BINARY_TRIANGLE_LEN) {
        // 12 bytes of normal, then three vertices of three f32 each
        let mut triangle = [[0.0; 3]; 3];
        for (v, vertex) in triangle.iter_mut().enumerate() {
            for (axis, coord) in vertex.iter_mut().enumerate() {
                let offset = 12 + v * 12 + axis * 4;
                let raw = [record[offset], record[offset + 1], record[offset + 2], record[offset + 3]];
                *coord = f32::from_le_bytes(raw) as f64;
            }
        }
        acc.push(triangle)?;
    }
    acc.finish()
}

fn parse_ascii(text: &str) -> Result<MeshStats, StlError> {
    let mut acc = Accumulator::new();
    let mut vertices: Vec<[f64; 3]> = Vec::with_capacity(3);
    let mut tokens = text.split_ascii_whitespace();

    while let Some(token) = tokens.next() {
        match token {
            "vertex" => {
                let mut vertex = [0.0; 3];
                for coord in vertex.iter_mut() {
                    let raw = tokens
                        .next()
                        .ok_or_else(|| StlError::InvalidAscii("vertex is missing coordinates".to_string()))?;
                    *coord = raw
                        .parse::<f64>()
                        .map_err(|_| StlError::InvalidAscii(format!("invalid coordinate '{raw}'")))?;
                }
                vertices.push(vertex);
            }
            "endloop" => {
                let [a, b, c] = vertices[..] else {
                    return Err(StlError::InvalidAscii(format!(
                        "facet has {} vertices, expected 3",
                        vertices.len()
                    )));
                };
                acc.push([a, b, c])?;
                vertices.clear();
            }
            _ => {}
        }
    }

    if !vertices.is_empty() {
        return Err(StlError::InvalidAscii("unterminated facet".to_string()));
    }
    acc.finish()
}
