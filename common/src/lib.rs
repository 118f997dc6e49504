pub mod cli;
pub mod util;
