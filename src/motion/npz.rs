//! # NPZ Codec
//!
//! Reads and writes NumPy `.npz` archives: a zip container whose members are
//! `.npy` arrays. The generation server replies with the bytes of an `.npz`
//! file and every persisted clip uses the same container, so this codec sits
//! underneath both the wire path and the artifact library.
//!
//! ## Supported Layouts
//!
//! | dtype | Rust storage |
//! |-------|--------------|
//! | `<f4` / `<f8` | [`NpyData::F32`] / [`NpyData::F64`] |
//! | `<i4` / `<i8` | [`NpyData::I32`] / [`NpyData::I64`] |
//! | `\|u1` / `\|b1` | [`NpyData::U8`] / [`NpyData::Bool`] |
//! | `<U{n}` | [`NpyData::Unicode`] (UTF-32LE, NUL padded) |
//!
//! Big-endian, Fortran-ordered and object (pickled) arrays are rejected.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Seek, Write};
use std::path::Path;

use ndarray::{Array2, ArrayD, IxDyn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::FormatError;

/// Leading bytes of every `.npy` member.
const MAGIC: &[u8] = b"\x93NUMPY";

/// Headers are padded so the payload starts on this boundary.
const HEADER_ALIGN: usize = 64;

/// Element storage of a decoded array, flattened in C (row-major) order.
#[derive(Debug, Clone, PartialEq)]
pub enum NpyData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
    Unicode(Vec<String>),
}

/// A single `.npy` array: its shape plus flattened elements.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: NpyData,
}

impl NpyArray {
    /// A zero-dimensional `float32` array.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: NpyData::F32(vec![value]),
        }
    }

    /// A 2-D `float32` array copied from an ndarray matrix.
    pub fn matrix_f32(matrix: &Array2<f32>) -> Self {
        Self {
            shape: matrix.shape().to_vec(),
            data: NpyData::F32(matrix.iter().copied().collect()),
        }
    }

    /// A 1-D unicode string array.
    pub fn strings<S: AsRef<str>>(values: &[S]) -> Self {
        Self {
            shape: vec![values.len()],
            data: NpyData::Unicode(values.iter().map(|s| s.as_ref().to_string()).collect()),
        }
    }

    /// Number of elements implied by the shape (1 for scalars).
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Casts a numeric array to `f32`, mirroring `astype(np.float32)`.
    pub fn to_f32(&self, field: &'static str) -> Result<ArrayD<f32>, FormatError> {
        let values: Vec<f32> = match &self.data {
            NpyData::F32(v) => v.clone(),
            NpyData::F64(v) => v.iter().map(|&x| x as f32).collect(),
            NpyData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            NpyData::I64(v) => v.iter().map(|&x| x as f32).collect(),
            NpyData::U8(v) => v.iter().map(|&x| f32::from(x)).collect(),
            NpyData::Bool(v) => v.iter().map(|&x| if x { 1.0 } else { 0.0 }).collect(),
            NpyData::Unicode(_) => {
                return Err(FormatError::BadShape {
                    field,
                    expected: "a numeric array".to_string(),
                    found: self.shape.clone(),
                })
            }
        };

        ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|_| FormatError::BadShape {
            field,
            expected: "element count matching shape".to_string(),
            found: self.shape.clone(),
        })
    }

    /// The single value of a one-element numeric array.
    pub fn scalar(&self) -> Option<f64> {
        if self.element_count() != 1 {
            return None;
        }
        match &self.data {
            NpyData::F32(v) => v.first().map(|&x| f64::from(x)),
            NpyData::F64(v) => v.first().copied(),
            NpyData::I32(v) => v.first().map(|&x| f64::from(x)),
            NpyData::I64(v) => v.first().map(|&x| x as f64),
            NpyData::U8(v) => v.first().map(|&x| f64::from(x)),
            NpyData::Bool(v) => v.first().map(|&x| if x { 1.0 } else { 0.0 }),
            NpyData::Unicode(_) => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match &self.data {
            NpyData::Unicode(v) => Some(v),
            _ => None,
        }
    }
}

/// Named arrays of one `.npz` archive, keyed by member name without `.npy`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NpzArchive {
    arrays: BTreeMap<String, NpyArray>,
}

impl NpzArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an archive held in memory (e.g. a binary WebSocket frame).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        Self::from_reader(Cursor::new(bytes))
    }

    /// Decodes an archive from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FormatError> {
        let file = File::open(path.as_ref()).map_err(|e| {
            FormatError::Archive(format!("cannot open {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_reader(file)
    }

    fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, FormatError> {
        let mut zip = ZipArchive::new(reader).map_err(|e| FormatError::Archive(e.to_string()))?;
        let mut arrays = BTreeMap::new();

        for index in 0..zip.len() {
            let mut member = zip
                .by_index(index)
                .map_err(|e| FormatError::Archive(e.to_string()))?;
            if member.is_dir() {
                continue;
            }

            let name = member.name().to_string();
            let key = name.strip_suffix(".npy").unwrap_or(&name).to_string();

            // The declared size is untrusted; cap the preallocation.
            let mut raw = Vec::with_capacity((member.size() as usize).min(1 << 26));
            member
                .read_to_end(&mut raw)
                .map_err(|e| FormatError::Archive(format!("reading '{}': {}", name, e)))?;

            let array = parse_npy(&key, &raw)?;
            arrays.insert(key, array);
        }

        Ok(Self { arrays })
    }

    pub fn insert(&mut self, key: impl Into<String>, array: NpyArray) {
        self.arrays.insert(key.into(), array);
    }

    pub fn get(&self, key: &str) -> Option<&NpyArray> {
        self.arrays.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.arrays.contains_key(key)
    }

    /// Member names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.arrays.keys().cloned().collect()
    }

    /// Serializes the archive to memory as an uncompressed zip, like `np.savez`.
    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Writes the archive to `path`, replacing any existing file.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer)?;
        writer.flush()
    }

    fn write<W: Write + Seek>(&self, sink: W) -> std::io::Result<()> {
        let mut zip = ZipWriter::new(sink);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        for (key, array) in &self.arrays {
            zip.start_file(format!("{}.npy", key), options)
                .map_err(std::io::Error::other)?;
            zip.write_all(&encode_npy(array))?;
        }

        zip.finish().map_err(std::io::Error::other)?;
        Ok(())
    }
}

struct NpyHeader {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

fn parse_npy(member: &str, bytes: &[u8]) -> Result<NpyArray, FormatError> {
    let fail = |reason: String| FormatError::Npy {
        member: member.to_string(),
        reason,
    };

    if bytes.len() < 10 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(fail("missing NUMPY magic".to_string()));
    }

    // Version 1.0 uses a u16 header length; 2.0 and 3.0 widen it to u32.
    let (header_len, offset) = match bytes[6] {
        1 => (usize::from(u16::from_le_bytes([bytes[8], bytes[9]])), 10),
        2 | 3 if bytes.len() >= 12 => (
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            12,
        ),
        version => return Err(fail(format!("unsupported format version {}", version))),
    };

    let header_end = offset + header_len;
    if bytes.len() < header_end {
        return Err(fail("truncated header".to_string()));
    }

    let text = std::str::from_utf8(&bytes[offset..header_end])
        .map_err(|_| fail("header is not valid text".to_string()))?;
    let header = parse_header(text).ok_or_else(|| fail(format!("malformed header {:?}", text.trim())))?;

    if header.fortran_order {
        return Err(fail("fortran-ordered arrays are not supported".to_string()));
    }

    let count = header
        .shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| fail(format!("shape {:?} overflows", header.shape)))?;
    let data = decode_payload(member, &header.descr, count, &bytes[header_end..])?;

    Ok(NpyArray {
        shape: header.shape,
        data,
    })
}

fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let quoted = format!("'{}'", key);
    let start = header.find(&quoted)? + quoted.len();
    header[start..].trim_start().strip_prefix(':').map(str::trim_start)
}

fn parse_header(header: &str) -> Option<NpyHeader> {
    let descr_raw = header_value(header, "descr")?;
    let quote = descr_raw.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let descr_body = &descr_raw[1..];
    let descr = descr_body[..descr_body.find(quote)?].to_string();

    let fortran_order = header_value(header, "fortran_order")?.starts_with("True");

    let shape_raw = header_value(header, "shape")?.strip_prefix('(')?;
    let shape = shape_raw[..shape_raw.find(')')?]
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.trim_end_matches('L').parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;

    Some(NpyHeader {
        descr,
        fortran_order,
        shape,
    })
}

fn take<'a>(member: &str, payload: &'a [u8], count: usize, width: usize) -> Result<&'a [u8], FormatError> {
    let short = || FormatError::Npy {
        member: member.to_string(),
        reason: format!("expected {} items of {} bytes, found {} bytes", count, width, payload.len()),
    };
    let needed = count.checked_mul(width).ok_or_else(short)?;
    if payload.len() < needed {
        return Err(short());
    }
    Ok(&payload[..needed])
}

fn decode_payload(member: &str, descr: &str, count: usize, payload: &[u8]) -> Result<NpyData, FormatError> {
    let unsupported = || FormatError::UnsupportedDtype {
        member: member.to_string(),
        descr: descr.to_string(),
    };

    if descr.len() < 2 {
        return Err(unsupported());
    }
    let (order, kind) = descr.split_at(1);
    // '=' is native order; every supported host is little-endian.
    let little_endian = matches!(order, "<" | "=" | "|");

    let data = match kind {
        "f4" if little_endian => NpyData::F32(
            take(member, payload, count, 4)?
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        "f8" if little_endian => NpyData::F64(
            take(member, payload, count, 8)?
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        "i4" if little_endian => NpyData::I32(
            take(member, payload, count, 4)?
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        "i8" if little_endian => NpyData::I64(
            take(member, payload, count, 8)?
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        "u1" => NpyData::U8(take(member, payload, count, 1)?.to_vec()),
        "b1" => NpyData::Bool(take(member, payload, count, 1)?.iter().map(|&b| b != 0).collect()),
        unicode if unicode.starts_with('U') && little_endian => {
            // numpy never writes `<U0`; its element count would be unbacked by payload.
            let chars: usize = unicode[1..].parse().map_err(|_| unsupported())?;
            let width = chars.checked_mul(4).filter(|&w| w > 0).ok_or_else(unsupported)?;
            let raw = take(member, payload, count, width)?;
            let strings = raw
                .chunks_exact(width)
                .map(|cell| decode_utf32(cell).ok_or_else(unsupported))
                .collect::<Result<Vec<_>, _>>()?;
            NpyData::Unicode(strings)
        }
        _ => return Err(unsupported()),
    };

    Ok(data)
}

fn decode_utf32(cell: &[u8]) -> Option<String> {
    let mut out = String::new();
    for unit in cell.chunks_exact(4) {
        let code = u32::from_le_bytes([unit[0], unit[1], unit[2], unit[3]]);
        if code == 0 {
            break;
        }
        out.push(char::from_u32(code)?);
    }
    Some(out)
}

fn encode_npy(array: &NpyArray) -> Vec<u8> {
    let (descr, body): (String, Vec<u8>) = match &array.data {
        NpyData::F32(v) => ("<f4".into(), v.iter().flat_map(|x| x.to_le_bytes()).collect()),
        NpyData::F64(v) => ("<f8".into(), v.iter().flat_map(|x| x.to_le_bytes()).collect()),
        NpyData::I32(v) => ("<i4".into(), v.iter().flat_map(|x| x.to_le_bytes()).collect()),
        NpyData::I64(v) => ("<i8".into(), v.iter().flat_map(|x| x.to_le_bytes()).collect()),
        NpyData::U8(v) => ("|u1".into(), v.clone()),
        NpyData::Bool(v) => ("|b1".into(), v.iter().map(|&b| u8::from(b)).collect()),
        NpyData::Unicode(v) => {
            let width = v.iter().map(|s| s.chars().count()).max().unwrap_or(0).max(1);
            let mut body = Vec::with_capacity(v.len() * width * 4);
            for s in v {
                let mut written = 0;
                for ch in s.chars() {
                    body.extend_from_slice(&u32::from(ch).to_le_bytes());
                    written += 1;
                }
                body.resize(body.len() + (width - written) * 4, 0);
            }
            (format!("<U{}", width), body)
        }
    };

    let shape = match array.shape.as_slice() {
        [] => "()".to_string(),
        [only] => format!("({},)", only),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };

    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    out
}
