//! Core library for the xyscan application.
//!
//! This library contains the experiment orchestrator, the instrument traits and
//! workers, the dataset writers and the configuration system of the XY-scanning
//! spectroscopy bench. The `xyscan` binary is a thin command-line front end on top of
//! it; a GUI talks to the same [`orchestrator::OrchestratorHandle`].

pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod instrument;
pub mod logging;
pub mod messages;
pub mod metadata;
pub mod orchestrator;
