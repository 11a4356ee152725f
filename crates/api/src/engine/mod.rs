//! Admission control and job dispatch.

pub mod admission;
pub mod dispatcher;

pub use admission::{AdmissionController, QuotaOutcome};
pub use dispatcher::{
    DispatchConfig, DispatchError, Dispatched, Dispatcher, PipelineCallResult,
};
