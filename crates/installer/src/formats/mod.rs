pub mod cnmt;
pub mod nca;
pub mod ncz;
pub mod pfs;
pub mod ticket;
