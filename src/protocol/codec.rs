//! Little-endian primitive codec over `bytes` buffers.
//!
//! Every getter checks the remaining length first, so a short buffer turns
//! into [`ProtocolError::Truncated`] instead of a panic inside `bytes`.
//! Matrices are written as `rows: u32, cols: u32` followed by row-major data.

use bytes::{Buf, BufMut};
use nalgebra::{Quaternion, Translation3, UnitQuaternion, Vector3};

use crate::map::{Descriptor, Pose, DESCRIPTOR_LEN};

use super::error::ProtocolError;

pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(buf: &mut impl Buf) -> Result<u8, ProtocolError> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32, ProtocolError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64, ProtocolError> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn get_f32(buf: &mut impl Buf) -> Result<f32, ProtocolError> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_f32_le())
}

pub fn get_f64(buf: &mut impl Buf) -> Result<f64, ProtocolError> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_f64_le())
}

/// Read a `u64` length prefix and check that `len * elem_size` bytes follow.
///
/// Guards allocations against corrupted counts.
pub fn get_len(buf: &mut impl Buf, elem_size: usize) -> Result<usize, ProtocolError> {
    let raw = get_u64(buf)?;
    let len = usize::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
        what: "length",
        value: raw,
    })?;
    ensure_remaining(buf, len.saturating_mul(elem_size))?;
    Ok(len)
}

/// Convert a wire index into a feature index.
pub fn to_index(raw: u64) -> Result<usize, ProtocolError> {
    usize::try_from(raw).map_err(|_| ProtocolError::InvalidValue {
        what: "feature index",
        value: raw,
    })
}

pub fn put_matrix_header(buf: &mut impl BufMut, rows: usize, cols: usize) {
    buf.put_u32_le(rows as u32);
    buf.put_u32_le(cols as u32);
}

/// Read a matrix header, requiring `cols` columns and, if given, `rows` rows.
///
/// Returns the row count.
pub fn get_matrix_header(
    buf: &mut impl Buf,
    what: &'static str,
    rows: Option<usize>,
    cols: usize,
) -> Result<usize, ProtocolError> {
    let found_rows = get_u32(buf)?;
    let found_cols = get_u32(buf)?;
    let rows_ok = rows.map_or(true, |r| r == found_rows as usize);
    if !rows_ok || found_cols as usize != cols {
        return Err(ProtocolError::MalformedMatrix {
            what,
            rows: found_rows,
            cols: found_cols,
        });
    }
    Ok(found_rows as usize)
}

pub const VECTOR3_LEN: usize = 8 + 3 * 8;

pub fn put_vector3(buf: &mut impl BufMut, v: &Vector3<f64>) {
    put_matrix_header(buf, 3, 1);
    for x in v.iter() {
        buf.put_f64_le(*x);
    }
}

pub fn get_vector3(buf: &mut impl Buf, what: &'static str) -> Result<Vector3<f64>, ProtocolError> {
    get_matrix_header(buf, what, Some(3), 1)?;
    ensure_remaining(buf, 3 * 8)?;
    Ok(Vector3::new(buf.get_f64_le(), buf.get_f64_le(), buf.get_f64_le()))
}

/// Pose as a 7x1 matrix: translation then quaternion (i, j, k, w).
pub const POSE_LEN: usize = 8 + 7 * 8;

pub fn put_pose(buf: &mut impl BufMut, pose: &Pose) {
    put_matrix_header(buf, 7, 1);
    let t = pose.translation.vector;
    let q = pose.rotation.quaternion();
    for x in [t.x, t.y, t.z, q.i, q.j, q.k, q.w] {
        buf.put_f64_le(x);
    }
}

pub fn get_pose(buf: &mut impl Buf) -> Result<Pose, ProtocolError> {
    get_matrix_header(buf, "pose", Some(7), 1)?;
    ensure_remaining(buf, 7 * 8)?;
    let mut v = [0.0f64; 7];
    for x in v.iter_mut() {
        *x = buf.get_f64_le();
    }
    let translation = Translation3::new(v[0], v[1], v[2]);
    let rotation = UnitQuaternion::new_unchecked(Quaternion::new(v[6], v[3], v[4], v[5]));
    Ok(Pose::from_parts(translation, rotation))
}

pub fn descriptors_len(n: usize) -> usize {
    8 + n * DESCRIPTOR_LEN
}

pub fn put_descriptors(buf: &mut impl BufMut, descriptors: &[Descriptor]) {
    put_matrix_header(buf, descriptors.len(), DESCRIPTOR_LEN);
    for d in descriptors {
        buf.put_slice(d.as_bytes());
    }
}

pub fn get_descriptors(
    buf: &mut impl Buf,
    rows: Option<usize>,
) -> Result<Vec<Descriptor>, ProtocolError> {
    let n = get_matrix_header(buf, "descriptor", rows, DESCRIPTOR_LEN)?;
    ensure_remaining(buf, n * DESCRIPTOR_LEN)?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let mut bytes = [0u8; DESCRIPTOR_LEN];
        buf.copy_to_slice(&mut bytes);
        out.push(Descriptor(bytes));
    }
    Ok(out)
}
