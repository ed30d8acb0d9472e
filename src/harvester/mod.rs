// SPDX-License-Identifier: Apache-2.0

//! Tailing of individual files.
//!
//! A [`Harvester`] follows one file (or standard input), cuts it into lines
//! with the [`line_reader`], optionally merges lines with the
//! [`multiline`] aggregator and sends [`Event`]s to the publisher. Events are
//! turned into JSON by the [`encoder`].

pub mod config;
pub mod encoder;
pub mod error;
pub mod event;
pub mod line_reader;
pub mod multiline;
mod worker;

pub use config::{FileConfig, HarvesterTimings, MultilineConfig, StartAt};
pub use error::{Error, Result};
pub use event::Event;
pub use worker::{ExitReason, HarvestExit, Harvester};
