mod probe;
mod serve;

pub use probe::probe;
pub use serve::{serve, serve_on};
