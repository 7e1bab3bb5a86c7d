//! Reads the quantization level of a GGUF weights file.
//!
//! A GGUF file starts with a small header followed by a list of typed
//! key/value pairs. The quantization level is stored under
//! `general.file_type` as an integer from llama.cpp's `llama_ftype`
//! enumeration. Only a prefix of the file is needed: the metadata comes
//! before the tensor data, and `general.*` keys are written before the
//! (large) tokenizer tables.

use std::collections::HashMap;

use lazy_static::lazy_static;
use thiserror::Error;

const GGUF_MAGIC: &[u8; 4] = b"GGUF";
const FILE_TYPE_KEY: &str = "general.file_type";

/// How many leading bytes of a file are fetched to read its metadata.
pub(crate) const HEADER_PROBE_BYTES: u64 = 512 * 1024;

lazy_static! {
    static ref FILE_TYPES: HashMap<u32, &'static str> = HashMap::from([
        (0, "F32"),
        (1, "F16"),
        (2, "Q4_0"),
        (3, "Q4_1"),
        (7, "Q8_0"),
        (8, "Q5_0"),
        (9, "Q5_1"),
        (10, "Q2_K"),
        (11, "Q3_K_S"),
        (12, "Q3_K_M"),
        (13, "Q3_K_L"),
        (14, "Q4_K_S"),
        (15, "Q4_K_M"),
        (16, "Q5_K_S"),
        (17, "Q5_K_M"),
        (18, "Q6_K"),
        (19, "IQ2_XXS"),
        (20, "IQ2_XS"),
        (21, "Q2_K_S"),
        (22, "IQ3_XS"),
        (23, "IQ3_XXS"),
        (24, "IQ1_S"),
        (25, "IQ4_NL"),
        (26, "IQ3_S"),
        (27, "IQ3_M"),
        (28, "IQ2_S"),
        (29, "IQ2_M"),
        (30, "IQ4_XS"),
        (31, "IQ1_M"),
        (32, "BF16"),
        (36, "TQ1_0"),
        (37, "TQ2_0"),
    ]);

    // Longest first so that "Q4_K_M" wins over "Q4_K" style prefixes
    static ref NAMES_BY_LENGTH: Vec<&'static str> = {
        let mut names: Vec<&'static str> = FILE_TYPES.values().copied().collect();
        names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        names
    };
}

#[derive(Error, Debug, PartialEq, Eq)]
pub(crate) enum GgufError {
    #[error("not a GGUF file")]
    BadMagic,
    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown metadata value type {0}")]
    UnknownValueType(u32),
    #[error("metadata ends before \"general.file_type\"")]
    Truncated,
    #[error("\"general.file_type\" is not an integer")]
    InvalidFileType,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], GgufError> {
        let end = self.pos.checked_add(n).ok_or(GgufError::Truncated)?;

        if end > self.buf.len() {
            return Err(GgufError::Truncated);
        }

        let bytes = &self.buf[self.pos..end];
        self.pos = end;

        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], GgufError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, GgufError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, GgufError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize, GgufError> {
        usize::try_from(self.u64()?).map_err(|_| GgufError::Truncated)
    }

    fn string(&mut self) -> Result<&'a [u8], GgufError> {
        let len = self.len()?;
        self.take(len)
    }

    /// Size in bytes of a fixed-width value type.
    fn scalar_width(ty: u32) -> Option<usize> {
        match ty {
            0 | 1 | 7 => Some(1),
            2 | 3 => Some(2),
            4 | 5 | 6 => Some(4),
            10 | 11 | 12 => Some(8),
            _ => None,
        }
    }

    fn skip_value(&mut self, ty: u32) -> Result<(), GgufError> {
        if let Some(width) = Self::scalar_width(ty) {
            self.take(width)?;
            return Ok(());
        }

        match ty {
            8 => {
                self.string()?;
            }
            9 => {
                let elem_ty = self.u32()?;
                let count = self.len()?;

                if let Some(width) = Self::scalar_width(elem_ty) {
                    let total = width.checked_mul(count).ok_or(GgufError::Truncated)?;
                    self.take(total)?;
                } else {
                    for _ in 0..count {
                        self.skip_value(elem_ty)?;
                    }
                }
            }
            ty => return Err(GgufError::UnknownValueType(ty)),
        }

        Ok(())
    }

    fn integer(&mut self, ty: u32) -> Result<u32, GgufError> {
        let value: i128 = match ty {
            0 => self.array::<1>()?[0] as i128,
            1 => i8::from_le_bytes(self.array()?) as i128,
            2 => u16::from_le_bytes(self.array()?) as i128,
            3 => i16::from_le_bytes(self.array()?) as i128,
            4 => self.u32()? as i128,
            5 => i32::from_le_bytes(self.array()?) as i128,
            10 => self.u64()? as i128,
            11 => i64::from_le_bytes(self.array()?) as i128,
            _ => return Err(GgufError::InvalidFileType),
        };

        u32::try_from(value).map_err(|_| GgufError::InvalidFileType)
    }
}

/// Returns the raw `general.file_type` of a GGUF header, or `None` when the
/// metadata was fully read and the key is absent.
pub(crate) fn read_file_type(header: &[u8]) -> Result<Option<u32>, GgufError> {
    let mut reader = Reader {
        buf: header,
        pos: 0,
    };

    if reader.take(4).map_err(|_| GgufError::BadMagic)? != GGUF_MAGIC {
        return Err(GgufError::BadMagic);
    }

    let version = reader.u32()?;

    // Version 1 used 32-bit counts and is long obsolete
    if version < 2 {
        return Err(GgufError::UnsupportedVersion(version));
    }

    let _tensor_count = reader.u64()?;
    let kv_count = reader.u64()?;

    for _ in 0..kv_count {
        let key = reader.string()?;
        let ty = reader.u32()?;

        if key == FILE_TYPE_KEY.as_bytes() {
            return reader.integer(ty).map(Some);
        }

        reader.skip_value(ty)?;
    }

    Ok(None)
}

/// The quantization name of a `general.file_type` value.
pub(crate) fn quant_name(file_type: u32) -> Option<&'static str> {
    FILE_TYPES.get(&file_type).copied()
}

/// Finds a quantization name embedded in a file name, e.g.
/// `Llama-3.1-8B-Instruct-Q4_K_M.gguf`. Matches are case-insensitive and must
/// not be glued to other letters, digits or underscores.
pub(crate) fn quant_from_file_name(file_name: &str) -> Option<&'static str> {
    let upper = file_name.to_ascii_uppercase();
    let bytes = upper.as_bytes();

    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    for name in NAMES_BY_LENGTH.iter() {
        for (start, _) in upper.match_indices(*name) {
            let end = start + name.len();

            let left_ok = start == 0 || !is_word(bytes[start - 1]);
            let right_ok = end == bytes.len() || !is_word(bytes[end]);

            if left_ok && right_ok {
                return Some(*name);
            }
        }
    }

    None
}
