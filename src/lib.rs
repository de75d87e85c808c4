pub use cadenza_core::*;
pub use cadenza_engine::*;
pub use cadenza_graph::*;
