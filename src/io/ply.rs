//! Binary little-endian PLY for colored point clouds.
//!
//! One vertex per point: `float x, y, z` then `uchar red, green, blue`.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::features::{pack_rgb, unpack_rgb};
use crate::mapping::TrackPoint;

/// A vertex as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlyVertex {
    pub position: [f32; 3],
    /// Packed `0xRRGGBB`.
    pub color: u32,
}

impl From<&TrackPoint> for PlyVertex {
    fn from(p: &TrackPoint) -> Self {
        Self {
            position: [p.position.x as f32, p.position.y as f32, p.position.z as f32],
            color: p.color,
        }
    }
}

pub fn write_ply<'a>(
    path: impl AsRef<Path>,
    points: impl ExactSizeIterator<Item = &'a TrackPoint>,
) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let count = points.len();
    write_vertices(&mut writer, count, points.map(PlyVertex::from))?;
    writer.flush()
}

pub fn write_vertices<W: Write>(
    writer: &mut W,
    count: usize,
    vertices: impl Iterator<Item = PlyVertex>,
) -> io::Result<()> {
    writeln!(writer, "ply")?;
    writeln!(writer, "format binary_little_endian 1.0")?;
    writeln!(writer, "comment sparse-sfm point cloud")?;
    writeln!(writer, "element vertex {}", count)?;
    writeln!(writer, "property float x")?;
    writeln!(writer, "property float y")?;
    writeln!(writer, "property float z")?;
    writeln!(writer, "property uchar red")?;
    writeln!(writer, "property uchar green")?;
    writeln!(writer, "property uchar blue")?;
    writeln!(writer, "end_header")?;

    for v in vertices {
        for c in v.position {
            writer.write_all(&c.to_le_bytes())?;
        }
        let (r, g, b) = unpack_rgb(v.color);
        writer.write_all(&[r, g, b])?;
    }
    Ok(())
}

pub fn read_ply(path: impl AsRef<Path>) -> io::Result<Vec<PlyVertex>> {
    let file = File::open(path)?;
    read_vertices(&mut BufReader::new(file))
}

/// Read files written by [`write_vertices`]. Other layouts are rejected.
pub fn read_vertices<R: BufRead>(reader: &mut R) -> io::Result<Vec<PlyVertex>> {
    let mut count = None;
    let mut properties = Vec::new();
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(invalid("unexpected EOF in header"));
        }
        let trimmed = line.trim();
        if trimmed == "end_header" {
            break;
        }
        let mut parts = trimmed.split_whitespace();
        match parts.next() {
            Some("format") if parts.next() != Some("binary_little_endian") => {
                return Err(invalid("only binary_little_endian is supported"));
            }
            Some("element") => {
                if parts.next() == Some("vertex") {
                    let n = parts
                        .next()
                        .and_then(|n| n.parse::<usize>().ok())
                        .ok_or_else(|| invalid("invalid vertex count"))?;
                    count = Some(n);
                }
            }
            Some("property") => properties.push(trimmed.to_string()),
            _ => {}
        }
    }

    let expected = [
        "property float x",
        "property float y",
        "property float z",
        "property uchar red",
        "property uchar green",
        "property uchar blue",
    ];
    if properties != expected {
        return Err(invalid("unexpected vertex layout"));
    }
    let count = count.ok_or_else(|| invalid("missing vertex element"))?;

    let mut vertices = Vec::with_capacity(count);
    let mut record = [0u8; 15];
    for _ in 0..count {
        reader.read_exact(&mut record)?;
        let f = |i: usize| f32::from_le_bytes([record[i], record[i + 1], record[i + 2], record[i + 3]]);
        vertices.push(PlyVertex {
            position: [f(0), f(4), f(8)],
            color: pack_rgb(record[12], record[13], record[14]),
        });
    }
    Ok(vertices)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
