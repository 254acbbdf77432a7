//! Admission control: may this user start a new download?

pub mod controller;
pub mod gate;

pub use controller::{decide, Admission, AdmissionController, AdmissionDecision, AdmissionInput, DenialReason};
pub use gate::{AdmissionGate, MembershipChecker};
