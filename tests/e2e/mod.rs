#![allow(dead_code)]

mod harness;
pub use harness::*;

mod clinic_scenario_tests;
mod failure_mode_tests;
