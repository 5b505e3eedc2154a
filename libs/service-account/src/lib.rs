pub mod controller;
pub mod crd;

mod reconcile;
