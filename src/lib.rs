//! Experiment assignment and exposure tracking for TokPulse storefronts.
//!
//! # Overview
//!
//! The crate answers two questions for a subject (customer, session, or anonymous visitor):
//! which variant of an experiment they get, and whether they have already been exposed to it.
//!
//! Variants are assigned by hashing the organization, experiment, and subject into one of 100
//! buckets (see [`bucketer`]). Subjects whose bucket falls under the experiment's traffic
//! allocation get the treatment variant, everyone else gets control. The assignment is a pure
//! function of its inputs, so any node can serve any request as long as it sees the same
//! experiment configuration.
//!
//! Assignments are persisted on the client in a *carrier* (see [`carrier`]): one `tp_xp_<key>`
//! cookie per experiment, or an aggregated `X-TokPulse-XP` header. A carried assignment always wins
//! over a fresh resolution, even after the experiment's traffic allocation changed.
//!
//! [`Client`] ties a [`Resolver`](resolver::Resolver) and an
//! [`ExposureRecorder`](exposure::ExposureRecorder) together and hands out the [`adapters`]:
//! an edge endpoint handler, a backend API helper, and a render-scoped provider.
//!
//! Experiment configuration comes from an [`ExperimentConfigSource`]. [`ConfigurationStore`] holds
//! a configuration document in memory; [`ConfigurationFetcher`] asks the experiments service.
//! Exposure events go to a [`TelemetrySink`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum, but they rarely reach the caller. Assignment
//! resolution and exposure recording never fail: lookup and telemetry errors are reported to
//! [`TelemetrySink::log_error`] and degrade to `None`, which callers treat as "show the default
//! experience". Only the edge endpoint produces user-visible errors (400, 404, 500).
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate with target `tokpulse`
//! and structured key-values. Consider integrating a `log`-compatible logger implementation for
//! better visibility into assignment decisions.
//!
//! # Examples
//!
//! A runnable example lives in `demos/simple` (`cargo run --example simple`).

#![warn(rustdoc::missing_crate_level_docs)]

pub mod adapters;
pub mod assignment;
pub mod bucketer;
pub mod carrier;
pub mod configuration_fetcher;
pub mod configuration_store;
pub mod eval;
pub mod experiment;
pub mod exposure;
pub mod resolver;
pub mod subject;
pub mod telemetry;

mod client;
mod config;
mod error;
mod source;
mod str;

pub use crate::str::Str;
pub use assignment::{Assignment, AssignmentSet};
pub use client::Client;
pub use config::ClientConfig;
pub use configuration_fetcher::{ConfigurationFetcher, ConfigurationFetcherConfig};
pub use configuration_store::ConfigurationStore;
pub use error::{ConfigError, Error, Result};
pub use experiment::{ExperimentConfig, ExperimentStatus, ExperimentsConfig};
pub use exposure::{ExposureEvent, ExposureResult, ExposureStatus};
pub use source::ExperimentConfigSource;
pub use subject::{RequestContext, SubjectIdentity, SubjectKey};
pub use telemetry::{ErrorContext, LogTelemetry, TelemetrySink};
