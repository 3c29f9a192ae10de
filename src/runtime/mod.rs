//! Runtime system
//!
//! This module contains cown memory management, epoch services and the
//! work-stealing scheduler with its leak-detection protocol.

pub mod cown;
pub mod epoch;
pub mod scheduler;
