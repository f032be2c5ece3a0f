//! Point-cloud export to ASCII PLY.
//!
//! Writes whatever the cache holds for a session as a standalone PLY
//! file, one vertex per point with 8-bit RGB. Colors are stored
//! normalized in `[0, 1]` everywhere else in the crate; export is where
//! they become bytes.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::chunk_store::ChunkStore;
use crate::error::Result;

/// Write paired coordinate/color arrays as an ASCII PLY document.
///
/// `coords` and `colors` are interleaved triples; unpaired arrays are
/// rejected rather than truncated.
pub fn write_ply<W: Write>(out: &mut W, coords: &[f32], colors: &[f32]) -> Result<()> {
    if coords.len() != colors.len() || coords.len() % 3 != 0 {
        return Err(crate::error::DecodeError::LengthMismatch {
            chunk_id: String::new(),
            coords: coords.len(),
            colors: colors.len(),
        }
        .into());
    }
    let vertex_count = coords.len() / 3;

    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {vertex_count}")?;
    writeln!(out, "property float x")?;
    writeln!(out, "property float y")?;
    writeln!(out, "property float z")?;
    writeln!(out, "property uchar red")?;
    writeln!(out, "property uchar green")?;
    writeln!(out, "property uchar blue")?;
    writeln!(out, "end_header")?;

    for i in 0..vertex_count {
        let c = &coords[i * 3..i * 3 + 3];
        let rgb = &colors[i * 3..i * 3 + 3];
        writeln!(
            out,
            "{} {} {} {} {} {}",
            c[0],
            c[1],
            c[2],
            to_u8(rgb[0]),
            to_u8(rgb[1]),
            to_u8(rgb[2]),
        )?;
    }

    Ok(())
}

fn to_u8(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Export one session's cached chunks, in sequence order, to a PLY file.
///
/// Returns the number of points written. An unknown session produces a
/// valid zero-vertex file.
pub fn export_session(
    store: &ChunkStore,
    session_id: &str,
    path: impl AsRef<Path>,
) -> Result<usize> {
    let chunks = store.get_by_session(session_id)?;

    let mut coords = Vec::new();
    let mut colors = Vec::new();
    for chunk in &chunks {
        coords.extend_from_slice(&chunk.coords);
        colors.extend_from_slice(&chunk.colors);
    }

    let mut out = BufWriter::new(File::create(path.as_ref())?);
    write_ply(&mut out, &coords, &colors)?;
    out.flush()?;

    let points = coords.len() / 3;
    info!(
        session_id,
        chunks = chunks.len(),
        points,
        path = %path.as_ref().display(),
        "session exported"
    );
    Ok(points)
}
