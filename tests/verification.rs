//! Verification integration tests.
//!
//! This module contains property-based and metamorphic tests:
//! - Property tests - invariants of the ordering, reassembly, archive, id and vote components
//!   under random inputs (proptest)
//! - Metamorphic tests - relationships between runs that see the same traffic differently

// Verification test modules
mod verification {
    pub mod metamorphic;
    pub mod property;
}
