//! csrunner binary internals: supervisor wiring and the stdio control
//! surface. Split out of `main.rs` so the surface can be driven end-to-end
//! in tests.

pub mod supervisor;
pub mod surface;

pub use supervisor::Supervisor;
pub use surface::serve;
