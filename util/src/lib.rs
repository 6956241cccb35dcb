pub mod file;
pub mod io;
pub mod time;
