pub mod io;
pub mod map;
pub mod mapper;
pub mod optimizer;
pub mod protocol;
