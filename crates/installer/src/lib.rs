pub use binrw;
pub use snafu;

mod brw_utils;
pub mod container;
pub mod crypto;
pub mod formats;
mod hexstring;
pub mod ids;
pub mod install;
pub mod ncm;
pub mod source;
pub mod version;

pub use hexstring::HexData;
