//! Per-job pipeline stages that run around the engine.
//!
//! Each stage is a small, independently testable unit:
//!
//! | Stage | Module | Runs |
//! |-------|--------|------|
//! | Input resolution | [`input`] | at submission, before admission |
//! | Workspace | [`workspace`] | worker, before checkout |
//! | Validation | [`validate`] | worker, after the engine run |
//! | Post-processing | [`postprocess`] | worker, PDF jobs with page limits or stamps |
//! | Delivery | [`deliver`] | worker, after validation |

pub mod deliver;
pub mod input;
pub mod postprocess;
pub mod validate;
pub mod workspace;
