//! Reader and writer for the NumPy `.npy` array format.
//!
//! A `.npy` file holds a single unnamed array: a magic string, a format version,
//! a little-endian header length, an ASCII header describing the array, then the
//! raw element data in C order. A typical header looks like:
//!
//! ```text
//! {'descr': '|u1', 'fortran_order': False, 'shape': (60000, 784), }
//! ```
//!
//! Format versions 1.0, 2.0 and 3.0 are read. Version 1.0 is written unless the
//! header does not fit a 16-bit length, in which case 2.0 is used.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{ArrayD, IxDyn};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, ErrorKind, Read, Write};
use std::num::ParseIntError;
use std::path::Path;
use thiserror::Error;

pub const NPY_MAGIC_STRING: &[u8] = b"\x93NUMPY";
pub const NPY_SUFFIX: &str = ".npy";

/// Headers are padded so the data section starts on this boundary.
const HEADER_ALIGNMENT: usize = 64;

/// Errors that can occur while reading or writing `.npy` data
#[derive(Debug, Error)]
pub enum NpyError {
    /// Wrapper for standard I/O errors, including truncated data sections
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The preamble or header dictionary could not be understood
    #[error("Invalid npy header: {0}")]
    Header(String),
    /// The element type descriptor is not one this reader handles
    #[error("Unsupported npy descr: {0}")]
    UnsupportedDescr(String),
    /// A dimension in the shape tuple is not a non-negative integer
    #[error("Invalid shape dimension: {0}")]
    ParseShape(#[from] ParseIntError),
    /// The element count does not fit the declared shape
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, NpyError>;

/// Element types understood by the reader and writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    U32,
    I32,
    I64,
    F32,
    F64,
}

impl DType {
    /// The little-endian descriptor written into headers.
    pub fn descr(self) -> &'static str {
        match self {
            DType::U8 => "|u1",
            DType::U32 => "<u4",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::F32 => "<f4",
            DType::F64 => "<f8",
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    fn from_descr(descr: &str) -> Result<Self> {
        if descr.is_empty() {
            return Err(NpyError::Header("empty descr".to_string()));
        }
        if descr.starts_with('>') {
            return Err(NpyError::UnsupportedDescr(format!(
                "big-endian descr {descr}"
            )));
        }
        match descr.trim_start_matches(['<', '=', '|']) {
            "B" | "u1" | "?" | "b1" => Ok(DType::U8),
            "I" | "u4" => Ok(DType::U32),
            "i" | "i4" => Ok(DType::I32),
            "q" | "i8" => Ok(DType::I64),
            "f" | "f4" => Ok(DType::F32),
            "d" | "f8" => Ok(DType::F64),
            other => Err(NpyError::UnsupportedDescr(other.to_string())),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::U8 => "uint8",
            DType::U32 => "uint32",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        };
        f.write_str(name)
    }
}

/// Parsed header dictionary of a `.npy` file.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub descr: DType,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

impl Header {
    /// Number of elements described by the shape (1 for a scalar).
    ///
    /// # Errors
    /// * `NpyError::Header` if the product of the dimensions overflows `usize`
    pub fn elem_count(&self) -> Result<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |count, &dim| count.checked_mul(dim))
            .ok_or_else(|| NpyError::Header(format!("shape {:?} overflows", self.shape)))
    }

    /// Size of the data section in bytes.
    ///
    /// # Errors
    /// * `NpyError::Header` if the size overflows `usize`
    pub fn byte_count(&self) -> Result<usize> {
        self.elem_count()?
            .checked_mul(self.descr.size_in_bytes())
            .ok_or_else(|| NpyError::Header(format!("shape {:?} overflows", self.shape)))
    }

    /// Renders the header dictionary, without padding or the trailing newline.
    pub fn render(&self) -> String {
        let fortran_order = if self.fortran_order { "True" } else { "False" };
        let mut shape = self
            .shape
            .iter()
            .map(|dim| dim.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if self.shape.len() == 1 {
            shape.push(',');
        }
        format!(
            "{{'descr': '{}', 'fortran_order': {fortran_order}, 'shape': ({shape}), }}",
            self.descr.descr()
        )
    }

    /// Parses a header dictionary such as
    /// `{'descr': '<f8', 'fortran_order': False, 'shape': (128,), }`.
    pub fn parse(header: &str) -> Result<Self> {
        let header =
            header.trim_matches(|c: char| c == '{' || c == '}' || c == ',' || c.is_whitespace());

        // Split on commas that are not nested inside the shape tuple.
        let mut entries = Vec::new();
        let mut depth = 0i32;
        let mut start = 0usize;
        for (index, c) in header.char_indices() {
            match c {
                '(' | '[' => depth += 1,
                ')' | ']' => depth -= 1,
                ',' if depth == 0 => {
                    entries.push(header.get(start..index).unwrap_or_default());
                    start = index + 1;
                }
                _ => {}
            }
        }
        entries.push(header.get(start..).unwrap_or_default());

        let mut fields: HashMap<&str, &str> = HashMap::new();
        for entry in entries.iter().map(|entry| entry.trim()) {
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once(':')
                .ok_or_else(|| NpyError::Header(format!("unable to parse entry {entry}")))?;
            let key = key.trim_matches(|c: char| c == '\'' || c == '"' || c.is_whitespace());
            let value = value.trim_matches(|c: char| c == '\'' || c == '"' || c.is_whitespace());
            fields.insert(key, value);
        }

        let descr = match fields.get("descr") {
            Some(descr) => DType::from_descr(descr)?,
            None => return Err(NpyError::Header("no descr in header".to_string())),
        };
        let fortran_order = match fields.get("fortran_order").copied() {
            None | Some("False") => false,
            Some("True") => true,
            Some(other) => {
                return Err(NpyError::Header(format!("unknown fortran_order {other}")));
            }
        };
        let shape = match fields.get("shape") {
            Some(shape) => {
                let shape = shape.trim_matches(|c: char| c == '(' || c == ')' || c == ',');
                if shape.trim().is_empty() {
                    Vec::new()
                } else {
                    shape
                        .split(',')
                        .map(|dim| dim.trim().parse::<usize>())
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
            }
            None => return Err(NpyError::Header("no shape in header".to_string())),
        };

        Ok(Self {
            descr,
            fortran_order,
            shape,
        })
    }
}

/// Reads the preamble and returns the raw header dictionary text.
fn read_header<R: Read>(reader: &mut R) -> Result<String> {
    let mut magic_string = [0u8; 6];
    reader.read_exact(&mut magic_string)?;
    if magic_string != NPY_MAGIC_STRING {
        return Err(NpyError::Header("magic string mismatch".to_string()));
    }
    let major = reader.read_u8()?;
    let _minor = reader.read_u8()?;
    let header_len = match major {
        1 => usize::from(reader.read_u16::<LittleEndian>()?),
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        otherwise => {
            return Err(NpyError::Header(format!("unsupported version {otherwise}")));
        }
    };
    let header = read_section(reader, header_len)?;
    Ok(String::from_utf8_lossy(&header).into_owned())
}

/// Reads exactly `len` bytes. The buffer grows with what the reader actually
/// supplies, so a length claimed by a corrupt header is never allocated up front.
fn read_section<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader.take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(NpyError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", bytes.len()),
        )));
    }
    Ok(bytes)
}

/// A multi-dimensional array read from, or to be written to, a `.npy` file.
#[derive(Debug, Clone, PartialEq)]
pub enum NpyArray {
    U8(ArrayD<u8>),
    U32(ArrayD<u32>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! impl_from_array {
    ($($elem:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<ArrayD<$elem>> for NpyArray {
                fn from(array: ArrayD<$elem>) -> Self {
                    NpyArray::$variant(array)
                }
            }
        )*
    };
}

impl_from_array!(u8 => U8, u32 => U32, i32 => I32, i64 => I64, f32 => F32, f64 => F64);

macro_rules! read_elements {
    ($reader:expr, $count:expr, $zero:expr, $read_into:ident) => {{
        let mut data = vec![$zero; $count];
        $reader.$read_into::<LittleEndian>(&mut data)?;
        data
    }};
}

macro_rules! write_elements {
    ($writer:expr, $array:expr, $write:ident) => {{
        for &value in $array.iter() {
            $writer.$write::<LittleEndian>(value)?;
        }
    }};
}

impl NpyArray {
    pub fn dtype(&self) -> DType {
        match self {
            NpyArray::U8(_) => DType::U8,
            NpyArray::U32(_) => DType::U32,
            NpyArray::I32(_) => DType::I32,
            NpyArray::I64(_) => DType::I64,
            NpyArray::F32(_) => DType::F32,
            NpyArray::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            NpyArray::U8(array) => array.shape(),
            NpyArray::U32(array) => array.shape(),
            NpyArray::I32(array) => array.shape(),
            NpyArray::I64(array) => array.shape(),
            NpyArray::F32(array) => array.shape(),
            NpyArray::F64(array) => array.shape(),
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn header(&self) -> Header {
        Header {
            descr: self.dtype(),
            fortran_order: false,
            shape: self.shape().to_vec(),
        }
    }

    /// Reads a complete `.npy` stream.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let header = Header::parse(&read_header(reader)?)?;
        if header.fortran_order {
            return Err(NpyError::Header("fortran order not supported".to_string()));
        }
        let count = header.elem_count()?;
        let bytes = read_section(reader, header.byte_count()?)?;
        let mut reader = Cursor::new(bytes);
        let shape = IxDyn(&header.shape);
        let array = match header.descr {
            DType::U8 => NpyArray::U8(ArrayD::from_shape_vec(shape, reader.into_inner())?),
            DType::U32 => {
                let data = read_elements!(reader, count, 0u32, read_u32_into);
                NpyArray::U32(ArrayD::from_shape_vec(shape, data)?)
            }
            DType::I32 => {
                let data = read_elements!(reader, count, 0i32, read_i32_into);
                NpyArray::I32(ArrayD::from_shape_vec(shape, data)?)
            }
            DType::I64 => {
                let data = read_elements!(reader, count, 0i64, read_i64_into);
                NpyArray::I64(ArrayD::from_shape_vec(shape, data)?)
            }
            DType::F32 => {
                let data = read_elements!(reader, count, 0f32, read_f32_into);
                NpyArray::F32(ArrayD::from_shape_vec(shape, data)?)
            }
            DType::F64 => {
                let data = read_elements!(reader, count, 0f64, read_f64_into);
                NpyArray::F64(ArrayD::from_shape_vec(shape, data)?)
            }
        };
        Ok(array)
    }

    /// Writes the array as a `.npy` stream in C order.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut header = self.header().render();
        let long_header = header.len() + 11 >= usize::from(u16::MAX);
        let preamble_len = NPY_MAGIC_STRING.len() + 2 + if long_header { 4 } else { 2 };
        let unpadded = preamble_len + header.len() + 1;
        let pad = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
        header.extend(std::iter::repeat_n(' ', pad));
        header.push('\n');

        writer.write_all(NPY_MAGIC_STRING)?;
        if long_header {
            writer.write_all(&[2, 0])?;
            let len = u32::try_from(header.len())
                .map_err(|_| NpyError::Header("header too long".to_string()))?;
            writer.write_u32::<LittleEndian>(len)?;
        } else {
            writer.write_all(&[1, 0])?;
            let len = u16::try_from(header.len())
                .map_err(|_| NpyError::Header("header too long".to_string()))?;
            writer.write_u16::<LittleEndian>(len)?;
        }
        writer.write_all(header.as_bytes())?;

        match self {
            NpyArray::U8(array) => {
                for &value in array.iter() {
                    writer.write_u8(value)?;
                }
            }
            NpyArray::U32(array) => write_elements!(writer, array, write_u32),
            NpyArray::I32(array) => write_elements!(writer, array, write_i32),
            NpyArray::I64(array) => write_elements!(writer, array, write_i64),
            NpyArray::F32(array) => write_elements!(writer, array, write_f32),
            NpyArray::F64(array) => write_elements!(writer, array, write_f64),
        }
        writer.flush()?;
        Ok(())
    }
}

/// Reads a `.npy` file and returns the stored array.
pub fn read_npy(path: impl AsRef<Path>) -> Result<NpyArray> {
    let mut reader = BufReader::new(File::open(path)?);
    NpyArray::read(&mut reader)
}

/// Writes an array to a `.npy` file, replacing any existing file.
pub fn write_npy(path: impl AsRef<Path>, array: &NpyArray) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    array.write(&mut writer)
}

/// Reads only the header of a `.npy` file, without loading the data section.
pub fn read_npy_header(path: impl AsRef<Path>) -> Result<Header> {
    let mut reader = BufReader::new(File::open(path)?);
    Header::parse(&read_header(&mut reader)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, array};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn raw_file(version: u8, header: &str, data: &[u8]) -> Vec<u8> {
        let mut bytes = NPY_MAGIC_STRING.to_vec();
        bytes.extend([version, 0]);
        if version == 1 {
            bytes.extend((header.len() as u16).to_le_bytes());
        } else {
            bytes.extend((header.len() as u32).to_le_bytes());
        }
        bytes.extend(header.as_bytes());
        bytes.extend(data);
        bytes
    }

    #[test]
    fn test_parse_header() {
        let h = "{'descr': '<f8', 'fortran_order': False, 'shape': (128,), }";
        assert_eq!(
            Header::parse(h).unwrap(),
            Header {
                descr: DType::F64,
                fortran_order: false,
                shape: vec![128],
            }
        );

        let h = "{'descr': '|u1', 'fortran_order': False, 'shape': (60000, 28, 28), }   \n";
        let header = Header::parse(h).unwrap();
        assert_eq!(header.descr, DType::U8);
        assert_eq!(header.shape, vec![60000, 28, 28]);
        assert_eq!(header.elem_count().unwrap(), 60000 * 784);
        assert_eq!(header.byte_count().unwrap(), 60000 * 784);

        let h = "{'descr': '<i8', 'fortran_order': True, 'shape': (), }";
        let header = Header::parse(h).unwrap();
        assert!(header.fortran_order);
        assert!(header.shape.is_empty());
        assert_eq!(header.elem_count().unwrap(), 1);
        assert_eq!(header.byte_count().unwrap(), 8);
    }

    #[test]
    fn test_render_header_matches_numpy_layout() {
        let header = Header {
            descr: DType::U8,
            fortran_order: false,
            shape: vec![3],
        };
        assert_eq!(
            header.render(),
            "{'descr': '|u1', 'fortran_order': False, 'shape': (3,), }"
        );

        let header = Header {
            descr: DType::F32,
            fortran_order: false,
            shape: vec![2, 1024],
        };
        assert_eq!(Header::parse(&header.render()).unwrap(), header);
    }

    #[test]
    fn test_parse_rejects_big_endian_and_unknown_descr() {
        let h = "{'descr': '>f4', 'fortran_order': False, 'shape': (2,), }";
        assert!(matches!(
            Header::parse(h),
            Err(NpyError::UnsupportedDescr(_))
        ));

        let h = "{'descr': '<c16', 'fortran_order': False, 'shape': (2,), }";
        assert!(matches!(
            Header::parse(h),
            Err(NpyError::UnsupportedDescr(_))
        ));

        let h = "{'fortran_order': False, 'shape': (2,), }";
        assert!(matches!(Header::parse(h), Err(NpyError::Header(_))));
    }

    #[test]
    fn test_write_pads_header_to_alignment() {
        let array = NpyArray::from(Array1::from(vec![1u8, 2, 3]).into_dyn());
        let mut bytes = Vec::new();
        array.write(&mut bytes).unwrap();

        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % HEADER_ALIGNMENT, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
        assert_eq!(&bytes[10 + header_len..], &[1, 2, 3]);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("images.npy");

        let images: Array2<f32> = array![[0.0, 0.5], [1.0, 0.25], [0.75, 0.125]];
        let original = NpyArray::from(images.into_dyn());
        write_npy(&path, &original).unwrap();

        let header = read_npy_header(&path).unwrap();
        assert_eq!(header.descr, DType::F32);
        assert_eq!(header.shape, vec![3, 2]);

        let loaded = read_npy(&path).unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.len(), 6);
    }

    #[test]
    fn test_read_version_two_int32() {
        let header = "{'descr': '<i4', 'fortran_order': False, 'shape': (2,), }\n";
        let mut data = Vec::new();
        data.extend(7i32.to_le_bytes());
        data.extend((-3i32).to_le_bytes());
        let bytes = raw_file(2, header, &data);

        let array = NpyArray::read(&mut Cursor::new(bytes)).unwrap();
        match array {
            NpyArray::I32(values) => assert_eq!(values.as_slice().unwrap(), &[7, -3]),
            other => panic!("Expected int32 array, got {:?}", other.dtype()),
        }
    }

    #[test]
    fn test_read_bool_as_u8() {
        let header = "{'descr': '|b1', 'fortran_order': False, 'shape': (3,), }\n";
        let bytes = raw_file(1, header, &[1, 0, 1]);
        let array = NpyArray::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(array.dtype(), DType::U8);
    }

    #[test]
    fn test_read_rejects_fortran_order() {
        let header = "{'descr': '|u1', 'fortran_order': True, 'shape': (2, 2), }\n";
        let bytes = raw_file(1, header, &[0, 1, 2, 3]);
        match NpyArray::read(&mut Cursor::new(bytes)) {
            Err(NpyError::Header(msg)) => assert!(msg.contains("fortran")),
            other => panic!("Expected fortran order error, got {other:?}"),
        }
    }

    #[test]
    fn test_read_truncated_data() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (4,), }\n";
        let bytes = raw_file(1, header, &[0u8; 12]);
        assert!(matches!(
            NpyArray::read(&mut Cursor::new(bytes)),
            Err(NpyError::Io(_))
        ));
    }

    #[test]
    fn test_read_rejects_overflowing_shapes() {
        // Byte count overflows even though the element count fits.
        let header = "{'descr': '<u4', 'fortran_order': False, 'shape': (4611686018427387904,), }\n";
        let bytes = raw_file(1, header, &[0u8; 16]);
        match NpyArray::read(&mut Cursor::new(bytes)) {
            Err(NpyError::Header(msg)) => assert!(msg.contains("overflows")),
            other => panic!("Expected overflow error, got {other:?}"),
        }

        let header =
            "{'descr': '|u1', 'fortran_order': False, 'shape': (4294967296, 4294967296, 16), }\n";
        let bytes = raw_file(1, header, &[0u8; 16]);
        match NpyArray::read(&mut Cursor::new(bytes)) {
            Err(NpyError::Header(msg)) => assert!(msg.contains("overflows")),
            other => panic!("Expected overflow error, got {other:?}"),
        }
    }

    #[test]
    fn test_read_huge_shape_with_short_data() {
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (1099511627776,), }\n";
        let bytes = raw_file(1, header, &[0u8; 32]);
        assert!(matches!(
            NpyArray::read(&mut Cursor::new(bytes)),
            Err(NpyError::Io(_))
        ));
    }

    #[test]
    fn test_read_bad_magic() {
        let mut bytes = raw_file(1, "{}", &[]);
        bytes[1] = b'X';
        match NpyArray::read(&mut Cursor::new(bytes)) {
            Err(NpyError::Header(msg)) => assert!(msg.contains("magic")),
            other => panic!("Expected magic string error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            read_npy(dir.path().join("absent.npy")),
            Err(NpyError::Io(_))
        ));
    }
}
