pub mod diagnostics;
pub mod table;

pub use table::{Lookup, PathPattern, Route, RouteTable};
