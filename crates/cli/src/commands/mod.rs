pub mod analyze;
pub mod disasm;
pub mod extract;
pub mod rules;
pub mod scan;

pub use analyze::*;
pub use disasm::*;
pub use extract::*;
pub use rules::*;
pub use scan::*;
