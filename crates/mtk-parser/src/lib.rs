//! Parser for the vendor "Download Agent" binary: a catalog of per-SoC
//! entries, each carrying the load regions of the staged DA images.

use bincode::Decode;

use crate::err::Error;

pub mod da;
pub mod err;

pub type Result<T> = core::result::Result<T, Error>;

pub use da::hl::{Da, Entry, Region};

pub trait LLParser: Decode<()> + Sized {
    fn parse(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding();
        bincode::decode_from_slice(data, config)
            .map(|r| r.0)
            .map_err(|e| e.into())
    }

    fn validate(&self) -> Result<()>;
}

pub trait HLParser<'a, T: LLParser>: Sized {
    fn parse(data: &'a [u8], position: usize, ll: T) -> Result<Self>;
}

pub fn parse_da(data: &[u8]) -> Result<Da<'_>> {
    Da::parse(
        data,
        size_of::<da::ll::Header>(),
        da::ll::Header::parse(data)?,
    )
}
