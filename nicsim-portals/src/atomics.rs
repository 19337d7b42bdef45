//! The atomic-operation engine.
//!
//! Operates element-wise on raw little-endian buffers: `target` is the
//! matched entry's memory, `operand` arrived on the wire, `constant` is the
//! swap-family third operand. The pre-operation value of the target can be
//! snapshotted for fetch-atomic replies.
//!
//! Long doubles keep their 16-byte ABI slot but are computed as f64 (the
//! upper bytes are zeroed on store).

use crate::error::{PtlError, Result};
use crate::types::{AtomicDatatype, AtomicOp};

fn load<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn ldbl_get(bytes: &[u8]) -> f64 {
    f64::from_le_bytes(load::<8>(bytes))
}

fn ldbl_set(bytes: &mut [u8], value: f64) {
    bytes[..8].copy_from_slice(&value.to_le_bytes());
    bytes[8..16].fill(0);
}

/// Apply `op` over `len` bytes of `target`. Validates that the length is a
/// whole number of elements and that swap-family operations cover exactly
/// one element. If `snapshot` is given, it receives the pre-operation bytes
/// of the target (the fetch-atomic transmit buffer).
pub fn apply_atomic_op(
    op: AtomicOp,
    datatype: AtomicDatatype,
    target: &mut [u8],
    operand: &[u8],
    constant: Option<&[u8]>,
    len: usize,
    mut snapshot: Option<&mut [u8]>,
) -> Result<()> {
    let asize = datatype.size();
    if len % asize != 0 || len > target.len() || len > operand.len() {
        return Err(PtlError::SizeInvalid);
    }
    let n = len / asize;
    if op.is_swap() && op != AtomicOp::Mswap && n != 1 {
        return Err(PtlError::SizeInvalid);
    }

    if let Some(snap) = snapshot.as_deref_mut() {
        let keep = snap.len().min(len);
        snap[..keep].copy_from_slice(&target[..keep]);
    }

    for i in 0..n {
        let t = &mut target[i * asize..(i + 1) * asize];
        let o = &operand[i * asize..(i + 1) * asize];
        apply_element(op, datatype, t, o, constant)?;
    }
    Ok(())
}

fn apply_element(
    op: AtomicOp,
    datatype: AtomicDatatype,
    t: &mut [u8],
    o: &[u8],
    constant: Option<&[u8]>,
) -> Result<()> {
    use AtomicOp::*;
    match op {
        Min => minmax(datatype, t, o, true),
        Max => minmax(datatype, t, o, false),
        Sum => arithmetic(datatype, t, o, true),
        Prod => arithmetic(datatype, t, o, false),
        Lor | Land | Lxor => logical(op, datatype, t, o),
        Bor | Band | Bxor => bitwise(op, datatype, t, o),
        Swap => {
            t.copy_from_slice(&o[..t.len()]);
            Ok(())
        }
        Cswap | CswapNe | CswapLe | CswapLt | CswapGe | CswapGt => {
            let cst = constant.ok_or(PtlError::ArgInvalid)?;
            conditional_swap(op, datatype, t, o, cst)
        }
        Mswap => {
            let cst = constant.ok_or(PtlError::ArgInvalid)?;
            if cst.len() < t.len() {
                return Err(PtlError::SizeInvalid);
            }
            for (j, byte) in t.iter_mut().enumerate() {
                *byte = (*byte & !cst[j]) | (o[j] & cst[j]);
            }
            Ok(())
        }
    }
}

fn minmax(datatype: AtomicDatatype, t: &mut [u8], o: &[u8], is_min: bool) -> Result<()> {
    macro_rules! mm {
        ($ty:ty, $n:literal) => {{
            let a = <$ty>::from_le_bytes(load::<$n>(t));
            let b = <$ty>::from_le_bytes(load::<$n>(o));
            let keep_b = if is_min { b < a } else { b > a };
            if keep_b {
                t.copy_from_slice(&b.to_le_bytes());
            }
        }};
    }
    use AtomicDatatype::*;
    match datatype {
        Int8 => mm!(i8, 1),
        Uint8 => mm!(u8, 1),
        Int16 => mm!(i16, 2),
        Uint16 => mm!(u16, 2),
        Int32 => mm!(i32, 4),
        Uint32 => mm!(u32, 4),
        Int64 => mm!(i64, 8),
        Uint64 => mm!(u64, 8),
        Float => mm!(f32, 4),
        Double => mm!(f64, 8),
        LongDouble => {
            let a = ldbl_get(t);
            let b = ldbl_get(o);
            let keep_b = if is_min { b < a } else { b > a };
            if keep_b {
                ldbl_set(t, b);
            }
        }
        // MIN/MAX are undefined on complex operands.
        FloatComplex | DoubleComplex | LongDoubleComplex => return Err(PtlError::ArgInvalid),
    }
    Ok(())
}

fn arithmetic(datatype: AtomicDatatype, t: &mut [u8], o: &[u8], is_sum: bool) -> Result<()> {
    macro_rules! int_arith {
        ($ty:ty, $n:literal) => {{
            let a = <$ty>::from_le_bytes(load::<$n>(t));
            let b = <$ty>::from_le_bytes(load::<$n>(o));
            let r = if is_sum {
                a.wrapping_add(b)
            } else {
                a.wrapping_mul(b)
            };
            t.copy_from_slice(&r.to_le_bytes());
        }};
    }
    macro_rules! float_arith {
        ($ty:ty, $n:literal) => {{
            let a = <$ty>::from_le_bytes(load::<$n>(t));
            let b = <$ty>::from_le_bytes(load::<$n>(o));
            let r = if is_sum { a + b } else { a * b };
            t.copy_from_slice(&r.to_le_bytes());
        }};
    }
    macro_rules! complex_arith {
        ($ty:ty, $n:literal) => {{
            let ar = <$ty>::from_le_bytes(load::<$n>(&t[..$n]));
            let ai = <$ty>::from_le_bytes(load::<$n>(&t[$n..]));
            let br = <$ty>::from_le_bytes(load::<$n>(&o[..$n]));
            let bi = <$ty>::from_le_bytes(load::<$n>(&o[$n..]));
            let (rr, ri) = if is_sum {
                (ar + br, ai + bi)
            } else {
                (ar * br - ai * bi, ar * bi + ai * br)
            };
            t[..$n].copy_from_slice(&rr.to_le_bytes());
            t[$n..].copy_from_slice(&ri.to_le_bytes());
        }};
    }
    use AtomicDatatype::*;
    match datatype {
        Int8 => int_arith!(i8, 1),
        Uint8 => int_arith!(u8, 1),
        Int16 => int_arith!(i16, 2),
        Uint16 => int_arith!(u16, 2),
        Int32 => int_arith!(i32, 4),
        Uint32 => int_arith!(u32, 4),
        Int64 => int_arith!(i64, 8),
        Uint64 => int_arith!(u64, 8),
        Float => float_arith!(f32, 4),
        Double => float_arith!(f64, 8),
        FloatComplex => complex_arith!(f32, 4),
        DoubleComplex => complex_arith!(f64, 8),
        LongDouble => {
            let r = if is_sum {
                ldbl_get(t) + ldbl_get(o)
            } else {
                ldbl_get(t) * ldbl_get(o)
            };
            ldbl_set(t, r);
        }
        LongDoubleComplex => {
            let (ar, ai) = (ldbl_get(&t[..16]), ldbl_get(&t[16..]));
            let (br, bi) = (ldbl_get(&o[..16]), ldbl_get(&o[16..]));
            let (rr, ri) = if is_sum {
                (ar + br, ai + bi)
            } else {
                (ar * br - ai * bi, ar * bi + ai * br)
            };
            ldbl_set(&mut t[..16], rr);
            ldbl_set(&mut t[16..], ri);
        }
    }
    Ok(())
}

fn logical(op: AtomicOp, datatype: AtomicDatatype, t: &mut [u8], o: &[u8]) -> Result<()> {
    macro_rules! logic {
        ($ty:ty, $n:literal) => {{
            let a = <$ty>::from_le_bytes(load::<$n>(t)) != 0;
            let b = <$ty>::from_le_bytes(load::<$n>(o)) != 0;
            let r = match op {
                AtomicOp::Lor => a || b,
                AtomicOp::Land => a && b,
                _ => a ^ b,
            };
            t.copy_from_slice(&(r as $ty).to_le_bytes());
        }};
    }
    use AtomicDatatype::*;
    match datatype {
        Int8 => logic!(i8, 1),
        Uint8 => logic!(u8, 1),
        Int16 => logic!(i16, 2),
        Uint16 => logic!(u16, 2),
        Int32 => logic!(i32, 4),
        Uint32 => logic!(u32, 4),
        Int64 => logic!(i64, 8),
        Uint64 => logic!(u64, 8),
        _ => return Err(PtlError::ArgInvalid),
    }
    Ok(())
}

fn bitwise(op: AtomicOp, datatype: AtomicDatatype, t: &mut [u8], o: &[u8]) -> Result<()> {
    use AtomicDatatype::*;
    if !matches!(
        datatype,
        Int8 | Uint8 | Int16 | Uint16 | Int32 | Uint32 | Int64 | Uint64
    ) {
        return Err(PtlError::ArgInvalid);
    }
    // Bitwise ops are width-agnostic.
    for (j, byte) in t.iter_mut().enumerate() {
        *byte = match op {
            AtomicOp::Bor => *byte | o[j],
            AtomicOp::Band => *byte & o[j],
            _ => *byte ^ o[j],
        };
    }
    Ok(())
}

fn conditional_swap(
    op: AtomicOp,
    datatype: AtomicDatatype,
    t: &mut [u8],
    o: &[u8],
    cst: &[u8],
) -> Result<()> {
    if cst.len() < datatype.size() {
        return Err(PtlError::SizeInvalid);
    }
    // eq / target>=cst / target<=cst, from which all six conditions derive.
    let (eq, ge_cst, le_cst);
    macro_rules! cmp {
        ($ty:ty, $n:literal) => {{
            let a = <$ty>::from_le_bytes(load::<$n>(t));
            let c = <$ty>::from_le_bytes(load::<$n>(cst));
            eq = a == c;
            ge_cst = a >= c;
            le_cst = a <= c;
        }};
    }
    macro_rules! cmp_complex {
        ($ty:ty, $n:literal) => {{
            let ar = <$ty>::from_le_bytes(load::<$n>(&t[..$n]));
            let ai = <$ty>::from_le_bytes(load::<$n>(&t[$n..]));
            let cr = <$ty>::from_le_bytes(load::<$n>(&cst[..$n]));
            let ci = <$ty>::from_le_bytes(load::<$n>(&cst[$n..]));
            eq = ar == cr && ai == ci;
            ge_cst = false;
            le_cst = false;
        }};
    }
    use AtomicDatatype::*;
    match datatype {
        Int8 => cmp!(i8, 1),
        Uint8 => cmp!(u8, 1),
        Int16 => cmp!(i16, 2),
        Uint16 => cmp!(u16, 2),
        Int32 => cmp!(i32, 4),
        Uint32 => cmp!(u32, 4),
        Int64 => cmp!(i64, 8),
        Uint64 => cmp!(u64, 8),
        Float => cmp!(f32, 4),
        Double => cmp!(f64, 8),
        LongDouble => {
            let a = ldbl_get(t);
            let c = ldbl_get(cst);
            eq = a == c;
            ge_cst = a >= c;
            le_cst = a <= c;
        }
        FloatComplex => cmp_complex!(f32, 4),
        DoubleComplex => cmp_complex!(f64, 8),
        LongDoubleComplex => {
            eq = ldbl_get(&t[..16]) == ldbl_get(&cst[..16])
                && ldbl_get(&t[16..]) == ldbl_get(&cst[16..]);
            ge_cst = false;
            le_cst = false;
        }
    }

    let swap = match op {
        AtomicOp::Cswap => eq,
        AtomicOp::CswapNe => !eq,
        AtomicOp::CswapLe => ge_cst,
        AtomicOp::CswapLt => ge_cst && !eq,
        AtomicOp::CswapGe => le_cst,
        AtomicOp::CswapGt => le_cst && !eq,
        _ => false,
    };
    if swap {
        t.copy_from_slice(&o[..t.len()]);
    }
    Ok(())
}

/// Encode an f64 into the long-double wire slot.
pub fn long_double_bytes(value: f64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&value.to_le_bytes());
    out
}

/// Decode a long-double wire slot.
pub fn long_double_value(bytes: &[u8]) -> f64 {
    ldbl_get(bytes)
}
