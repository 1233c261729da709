//! Rate and concurrency control
//!
//! Every HTTP fetch passes through [`RateController::acquire`].

mod controller;

pub use controller::{RateController, RateEvent, RatePermit};
