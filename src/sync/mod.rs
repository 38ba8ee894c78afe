//! Folder reconciliation between the local store and the CMS.

pub mod model;
mod reconcile;

pub use reconcile::{PassReport, Reconciler};
