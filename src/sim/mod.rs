//! Simulator Operations
//!
//! Execution, prediction-market, and valuation operations layered on the
//! ledger store, plus the shared error taxonomy.

pub mod error;
pub mod execution;
pub mod prediction;
pub mod valuation;
