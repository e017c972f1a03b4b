//! Graph IR consumed by the partial escape analysis
//!
//! This module defines the scheduled, block-structured graph that the escape
//! analysis walks. Nodes live in an arena and are addressed by [`NodeId`];
//! blocks carry an ordered schedule of fixed nodes plus their phis. The IR is
//! designed to be:
//! - Explicit about control flow (predecessor order is significant)
//! - Cheap to mutate through the primitives in [`graph`]
//! - Easy to build by hand through [`GraphBuilder`]

pub mod blocks;
pub mod builder;
pub mod cfg;
pub mod graph;
pub mod loop_analysis;
pub mod optimization;
pub mod types;
pub mod validation;

pub use blocks::*;
pub use builder::*;
pub use cfg::*;
pub use graph::*;
pub use loop_analysis::*;
pub use optimization::*;
pub use types::*;

use std::fmt;

/// Defines a `u32` id newtype with a display prefix.
macro_rules! define_ir_id {
    (
        $(#[$meta:meta])*
        $name:ident, $prefix:literal
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            pub const fn invalid() -> Self {
                Self(u32::MAX)
            }

            pub const fn is_valid(&self) -> bool {
                self.0 != u32::MAX
            }

            pub const fn as_u32(self) -> u32 {
                self.0
            }

            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_ir_id!(
    /// Identifier of a node in the graph arena
    NodeId,
    "n"
);
define_ir_id!(
    /// Identifier of a scheduled block
    BlockId,
    "bb"
);
define_ir_id!(
    /// Identifier of a class declared in the graph
    ClassId,
    "class"
);
define_ir_id!(
    /// Identity of an allocation tracked by the escape analysis
    VirtualObjectId,
    "vobj"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(NodeId::new(7).to_string(), "n7");
        assert_eq!(BlockId::new(3).to_string(), "bb3");
        assert_eq!(ClassId::new(0).to_string(), "class0");
    }

    #[test]
    fn test_invalid_ids() {
        let id = NodeId::new(42);
        assert!(id.is_valid());
        assert_eq!(id.index(), 42);

        let invalid = BlockId::invalid();
        assert!(!invalid.is_valid());
    }
}
