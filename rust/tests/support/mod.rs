#![allow(dead_code)]

mod fakes;
mod helpers;

pub use fakes::*;
pub use helpers::*;
