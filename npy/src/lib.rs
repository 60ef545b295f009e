pub mod npy;

pub use crate::npy::{
    DType, Header, NPY_MAGIC_STRING, NPY_SUFFIX, NpyArray, NpyError, read_npy, read_npy_header,
    write_npy,
};
