//! Binary record helpers.
//!
//! Every record starts with an ASCII version tag naming the primitive and its
//! format revision, followed by the primitive's fields in a fixed order.
//! Scalars are little-endian; strings and tensors are length-prefixed.

use std::fmt::{Display, Write as _};
use std::io::{Read, Write};

use crate::{AliasTensor, LayerError, Multipliers, Result, Tensor, TensorShape};

const MAX_TAG_LEN: usize = 256;

pub fn write_str(out: &mut dyn Write, value: &str) -> Result<()> {
    write_u64(out, value.len() as u64)?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

pub fn read_str(input: &mut dyn Read) -> Result<String> {
    let len = read_u64(input)? as usize;
    if len > MAX_TAG_LEN {
        return Err(LayerError::Malformed(format!(
            "string of {len} bytes exceeds the {MAX_TAG_LEN} byte limit"
        )));
    }
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|err| LayerError::Malformed(err.to_string()))
}

/// Reads a version tag and checks it against the tags `layer` accepts.
pub fn read_version(input: &mut dyn Read, layer: &'static str, accepted: &[&str]) -> Result<String> {
    let found = read_str(input)?;
    if accepted.contains(&found.as_str()) {
        Ok(found)
    } else {
        Err(LayerError::UnknownVersion { layer, found })
    }
}

pub fn write_u64(out: &mut dyn Write, value: u64) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64(input: &mut dyn Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_i64(out: &mut dyn Write, value: i64) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_i64(input: &mut dyn Read) -> Result<i64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

pub fn write_usize(out: &mut dyn Write, value: usize) -> Result<()> {
    write_u64(out, value as u64)
}

pub fn read_usize(input: &mut dyn Read) -> Result<usize> {
    let value = read_u64(input)?;
    usize::try_from(value).map_err(|_| LayerError::Malformed(format!("{value} overflows usize")))
}

pub fn write_f64(out: &mut dyn Write, value: f64) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_f64(input: &mut dyn Read) -> Result<f64> {
    let mut bytes = [0u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(f64::from_le_bytes(bytes))
}

pub fn write_f32(out: &mut dyn Write, value: f32) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_f32(input: &mut dyn Read) -> Result<f32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(f32::from_le_bytes(bytes))
}

pub fn write_bool(out: &mut dyn Write, value: bool) -> Result<()> {
    out.write_all(&[u8::from(value)])?;
    Ok(())
}

pub fn read_bool(input: &mut dyn Read) -> Result<bool> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    match byte[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(LayerError::Malformed(format!("invalid bool byte {other}"))),
    }
}

/// Writes the four dimensions followed by the values.
pub fn write_tensor(out: &mut dyn Write, tensor: &Tensor) -> Result<()> {
    write_shape(out, tensor.shape())?;
    let mut bytes = Vec::with_capacity(tensor.size() * 4);
    for v in tensor.host() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    out.write_all(&bytes)?;
    Ok(())
}

pub fn read_tensor(input: &mut dyn Read) -> Result<Tensor> {
    let shape = read_shape(input)?;
    let mut bytes = vec![0u8; shape.size() * 4];
    input.read_exact(&mut bytes)?;
    let data = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Tensor::from_vec(shape, data)
}

pub fn write_shape(out: &mut dyn Write, shape: TensorShape) -> Result<()> {
    for dim in shape.dims() {
        write_usize(out, dim)?;
    }
    Ok(())
}

pub fn read_shape(input: &mut dyn Read) -> Result<TensorShape> {
    Ok(TensorShape::new(
        read_usize(input)?,
        read_usize(input)?,
        read_usize(input)?,
        read_usize(input)?,
    ))
}

pub fn write_alias(out: &mut dyn Write, alias: &AliasTensor) -> Result<()> {
    write_shape(out, alias.shape())?;
    write_usize(out, alias.offset())
}

pub fn read_alias(input: &mut dyn Read) -> Result<AliasTensor> {
    let shape = read_shape(input)?;
    Ok(AliasTensor::new(shape, read_usize(input)?))
}

/// Learning rate, weight decay, bias learning rate, bias weight decay.
pub fn write_multipliers(out: &mut dyn Write, m: &Multipliers) -> Result<()> {
    write_f64(out, m.learning_rate)?;
    write_f64(out, m.weight_decay)?;
    write_f64(out, m.bias_learning_rate)?;
    write_f64(out, m.bias_weight_decay)
}

pub fn read_multipliers(input: &mut dyn Read) -> Result<Multipliers> {
    Ok(Multipliers::new(
        read_f64(input)?,
        read_f64(input)?,
        read_f64(input)?,
        read_f64(input)?,
    ))
}

/// Fails with [`LayerError::FieldMismatch`] unless `found == expected`.
pub fn check_field<T: PartialEq + Display>(
    layer: &'static str,
    field: &'static str,
    expected: T,
    found: T,
) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(LayerError::FieldMismatch {
            layer,
            field,
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

/// Renders tensor values as text, one sample per line.
pub fn tensor_text(tensor: &Tensor) -> String {
    let mut text = String::new();
    let row = tensor.shape().sample_size().max(1);
    for chunk in tensor.host().chunks(row) {
        let line = chunk
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(text, "{line}");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn tensor_record_survives_a_byte_stream() -> Result<()> {
        let t = Tensor::from_vec(TensorShape::new(1, 2, 1, 2), vec![1.0, -2.5, 3.25, 0.0])?;
        let mut buf = Vec::new();
        write_str(&mut buf, "record_")?;
        write_tensor(&mut buf, &t)?;
        write_bool(&mut buf, true)?;

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_version(&mut cursor, "record", &["record_"])?, "record_");
        assert_eq!(read_tensor(&mut cursor)?, t);
        assert!(read_bool(&mut cursor)?);
        Ok(())
    }

    #[test]
    fn unexpected_version_is_reported() -> Result<()> {
        let mut buf = Vec::new();
        write_str(&mut buf, "relu_")?;
        let err = read_version(&mut Cursor::new(buf), "con", &["con_6"]).unwrap_err();
        assert!(err.to_string().contains("unexpected version 'relu_'"));
        Ok(())
    }

    #[test]
    fn truncated_stream_is_an_io_error() {
        let err = read_f64(&mut Cursor::new(vec![0u8; 3])).unwrap_err();
        assert!(matches!(err, LayerError::Io(_)));
    }
}
