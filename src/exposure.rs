//! Exposure recording.
//!
//! An exposure is the moment a subject actually encounters a variant, as opposed to being assigned
//! one. [`ExposureRecorder`] persists at most one exposure per (subject, experiment, surface)
//! within a retention window and never lets a telemetry failure reach the surface that triggered
//! it.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    telemetry::{ErrorContext, TelemetrySink},
    Error, Str,
};

/// Well-known surfaces.
pub mod surface {
    /// Edge function.
    pub const EDGE: &str = "edge";
    /// Client-side rendering.
    pub const REACT: &str = "react";
    /// Backend API.
    pub const SERVER: &str = "server";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureRecord {
    pub subject_key: Str,
    pub experiment_key: Str,
    pub surface: Str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetaData {
    pub sdk_name: &'static str,
    pub sdk_version: &'static str,
}

impl Default for EventMetaData {
    fn default() -> EventMetaData {
        EventMetaData {
            sdk_name: env!("CARGO_PKG_NAME"),
            sdk_version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Event handed to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureEvent {
    #[serde(flatten)]
    pub record: ExposureRecord,
    pub org_id: Str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_id: Option<Str>,
    pub meta_data: EventMetaData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExposureStatus {
    /// Written to the telemetry sink by this call.
    Recorded,
    /// Already recorded within the retention window. Nothing was written.
    AlreadyRecorded,
}

/// Successful outcome of [`ExposureRecorder::record_exposure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureResult {
    pub record: ExposureRecord,
    pub status: ExposureStatus,
}

/// Counters of a recorder. Every call counts, including suppressed duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureStats {
    pub attempts: u64,
    pub recorded: u64,
    pub duplicates: u64,
    pub failures: u64,
}

pub struct ExposureRecorderConfig {
    pub sink: Arc<dyn TelemetrySink>,
    /// Maximum time to wait for the sink. The write is abandoned after that.
    pub timeout: Duration,
    /// How long a recorded exposure suppresses duplicates.
    pub retention: Duration,
    /// Maximum number of remembered exposures. Oldest are forgotten first.
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExposureKey {
    subject_key: Str,
    experiment_key: Str,
    surface: Str,
}

/// Remembers recent exposures in insertion order.
#[derive(Default)]
struct ExposureLedger {
    recorded_at: HashMap<ExposureKey, DateTime<Utc>>,
    order: VecDeque<(ExposureKey, DateTime<Utc>)>,
}

impl ExposureLedger {
    /// Claim `key`. Returns `false` if it was claimed within the retention window.
    fn reserve(
        &mut self,
        key: &ExposureKey,
        now: DateTime<Utc>,
        retention: chrono::Duration,
        capacity: usize,
    ) -> bool {
        self.evict(|at| {
            at.checked_add_signed(retention)
                .is_some_and(|expires_at| expires_at <= now)
        });

        if self.recorded_at.contains_key(key) {
            return false;
        }

        while self.recorded_at.len() >= capacity.max(1) {
            if !self.evict_oldest() {
                break;
            }
        }

        self.recorded_at.insert(key.clone(), now);
        self.order.push_back((key.clone(), now));
        true
    }

    /// Drop a claim so a later call can retry.
    fn release(&mut self, key: &ExposureKey, reserved_at: DateTime<Utc>) {
        if self.recorded_at.get(key) != Some(&reserved_at) {
            return;
        }
        self.recorded_at.remove(key);

        // Usually the most recent entry, so search from the back.
        if let Some(index) = self
            .order
            .iter()
            .rposition(|(k, at)| k == key && *at == reserved_at)
        {
            self.order.remove(index);
        }
    }

    fn evict(&mut self, expired: impl Fn(&DateTime<Utc>) -> bool) {
        while let Some((_, at)) = self.order.front() {
            if !expired(at) {
                break;
            }
            self.evict_oldest();
        }
    }

    /// Remove the oldest entry.
    fn evict_oldest(&mut self) -> bool {
        while let Some((key, at)) = self.order.pop_front() {
            if self.recorded_at.get(&key) == Some(&at) {
                self.recorded_at.remove(&key);
                return true;
            }
        }
        false
    }
}

#[derive(Default)]
struct Counters {
    attempts: AtomicU64,
    recorded: AtomicU64,
    duplicates: AtomicU64,
    failures: AtomicU64,
}

pub struct ExposureRecorder {
    config: ExposureRecorderConfig,
    retention: chrono::Duration,
    meta_data: EventMetaData,
    ledger: Mutex<ExposureLedger>,
    counters: Counters,
}

impl ExposureRecorder {
    pub fn new(config: ExposureRecorderConfig) -> ExposureRecorder {
        let retention = chrono::Duration::from_std(config.retention)
            .unwrap_or(chrono::TimeDelta::MAX);
        ExposureRecorder {
            config,
            retention,
            meta_data: EventMetaData::default(),
            ledger: Mutex::new(ExposureLedger::default()),
            counters: Counters::default(),
        }
    }

    /// Record that the subject encountered the experiment on `surface`.
    ///
    /// Repeated calls with the same subject, experiment, and surface are successful no-ops.
    /// Returns `None` if the telemetry sink failed or timed out; the failure is logged and
    /// reported, and the exposure may be retried by a later call.
    pub async fn record_exposure(
        &self,
        org_id: &str,
        store_id: Option<&str>,
        subject_key: &str,
        experiment_key: &str,
        surface: &str,
    ) -> Option<ExposureResult> {
        self.record_exposure_at(
            org_id,
            store_id,
            subject_key,
            experiment_key,
            surface,
            Utc::now(),
        )
        .await
    }

    pub(crate) async fn record_exposure_at(
        &self,
        org_id: &str,
        store_id: Option<&str>,
        subject_key: &str,
        experiment_key: &str,
        surface: &str,
        now: DateTime<Utc>,
    ) -> Option<ExposureResult> {
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let key = ExposureKey {
            subject_key: subject_key.into(),
            experiment_key: experiment_key.into(),
            surface: surface.into(),
        };
        let record = ExposureRecord {
            subject_key: key.subject_key.clone(),
            experiment_key: key.experiment_key.clone(),
            surface: key.surface.clone(),
            timestamp: now,
        };

        let reserved = self.ledger().reserve(
            &key,
            now,
            self.retention,
            self.config.capacity,
        );
        if !reserved {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            log::trace!(target: "tokpulse", org_id, subject_key, experiment_key, surface; "exposure already recorded");
            return Some(ExposureResult {
                record,
                status: ExposureStatus::AlreadyRecorded,
            });
        }

        let event = ExposureEvent {
            record: record.clone(),
            org_id: org_id.into(),
            store_id: store_id.map(Str::from),
            meta_data: self.meta_data,
        };

        let result =
            match tokio::time::timeout(self.config.timeout, self.config.sink.log_exposure(&event))
                .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::TelemetryTimeout),
            };

        match result {
            Ok(()) => {
                self.counters.recorded.fetch_add(1, Ordering::Relaxed);
                log::trace!(target: "tokpulse", event:serde; "recorded exposure");
                Some(ExposureResult {
                    record,
                    status: ExposureStatus::Recorded,
                })
            }
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.ledger().release(&key, now);
                log::warn!(target: "tokpulse", org_id, subject_key, experiment_key, surface; "failed to record exposure: {err}");
                self.config.sink.log_error(
                    &err,
                    &ErrorContext {
                        operation: "record_exposure",
                        org_id: org_id.into(),
                        experiment_key: Some(key.experiment_key),
                        subject_key: Some(key.subject_key),
                    },
                );
                None
            }
        }
    }

    pub fn stats(&self) -> ExposureStats {
        ExposureStats {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, ExposureLedger> {
        // Ledger operations do not panic midway, so a poisoned ledger is still consistent.
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{telemetry::testing::RecordingTelemetry, Result};

    fn recorder(sink: Arc<dyn TelemetrySink>) -> ExposureRecorder {
        ExposureRecorder::new(ExposureRecorderConfig {
            sink,
            timeout: Duration::from_millis(300),
            retention: Duration::from_secs(3600),
            capacity: 1_000,
        })
    }

    #[tokio::test]
    async fn records_exposure_once() {
        let _ = env_logger::builder().is_test(true).try_init();

        let sink = Arc::new(RecordingTelemetry::default());
        let recorder = recorder(sink.clone());

        let first = recorder
            .record_exposure("org1", Some("store1"), "user42", "exp1", surface::REACT)
            .await
            .unwrap();
        let second = recorder
            .record_exposure("org1", Some("store1"), "user42", "exp1", surface::REACT)
            .await
            .unwrap();

        assert_eq!(first.status, ExposureStatus::Recorded);
        assert_eq!(second.status, ExposureStatus::AlreadyRecorded);
        assert_eq!(sink.exposure_count(), 1);

        let event = sink.exposures.lock().unwrap()[0].clone();
        assert_eq!(event.org_id, "org1");
        assert_eq!(event.store_id, Some(Str::from("store1")));
        assert_eq!(event.record.surface, "react");

        assert_eq!(
            recorder.stats(),
            ExposureStats {
                attempts: 2,
                recorded: 1,
                duplicates: 1,
                failures: 0,
            }
        );
    }

    #[tokio::test]
    async fn distinct_surfaces_are_distinct_exposures() {
        let sink = Arc::new(RecordingTelemetry::default());
        let recorder = recorder(sink.clone());

        for surface in [surface::EDGE, surface::REACT, surface::SERVER] {
            let result = recorder
                .record_exposure("org1", None, "user42", "exp1", surface)
                .await
                .unwrap();
            assert_eq!(result.status, ExposureStatus::Recorded);
        }
        recorder
            .record_exposure("org1", None, "user43", "exp1", surface::REACT)
            .await
            .unwrap();

        assert_eq!(sink.exposure_count(), 4);
    }

    #[tokio::test]
    async fn sink_failure_is_absorbed_and_retryable() {
        let sink = Arc::new(RecordingTelemetry::failing());
        let recorder = recorder(sink.clone());

        assert_eq!(
            recorder
                .record_exposure("org1", None, "user42", "exp1", surface::REACT)
                .await,
            None
        );
        assert_eq!(
            recorder
                .record_exposure("org1", None, "user42", "exp1", surface::REACT)
                .await,
            None
        );

        assert_eq!(sink.error_count(), 2);
        assert_eq!(recorder.stats().failures, 2);
        assert_eq!(recorder.stats().duplicates, 0);
    }

    struct SlowSink;

    #[async_trait]
    impl TelemetrySink for SlowSink {
        async fn log_exposure(&self, _event: &ExposureEvent) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        }

        fn log_error(&self, _error: &Error, _context: &ErrorContext) {}
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_is_abandoned() {
        let recorder = recorder(Arc::new(SlowSink));

        let result = recorder
            .record_exposure("org1", None, "user42", "exp1", surface::EDGE)
            .await;

        assert_eq!(result, None);
        assert_eq!(recorder.stats().failures, 1);
    }

    #[tokio::test]
    async fn closure_sink() {
        let sink: Arc<dyn TelemetrySink> = Arc::new(|event: &ExposureEvent| -> Result<()> {
            assert_eq!(event.record.experiment_key, "exp1");
            Ok(())
        });
        let recorder = recorder(sink);

        let result = recorder
            .record_exposure("org1", None, "user42", "exp1", surface::SERVER)
            .await
            .unwrap();
        assert_eq!(result.status, ExposureStatus::Recorded);
    }

    #[tokio::test]
    async fn duplicates_expire_after_retention() {
        let sink = Arc::new(RecordingTelemetry::default());
        let recorder = recorder(sink.clone());
        let start = Utc::now();

        let recorder = &recorder;
        let record = move |now: DateTime<Utc>| {
            recorder.record_exposure_at("org1", None, "user42", "exp1", surface::REACT, now)
        };

        assert_eq!(record(start).await.unwrap().status, ExposureStatus::Recorded);
        assert_eq!(
            record(start + chrono::Duration::minutes(59)).await.unwrap().status,
            ExposureStatus::AlreadyRecorded
        );
        assert_eq!(
            record(start + chrono::Duration::minutes(61)).await.unwrap().status,
            ExposureStatus::Recorded
        );
        assert_eq!(sink.exposure_count(), 2);
    }

    #[tokio::test]
    async fn ledger_is_bounded() {
        let sink = Arc::new(RecordingTelemetry::default());
        let recorder = ExposureRecorder::new(ExposureRecorderConfig {
            sink: sink.clone(),
            timeout: Duration::from_millis(300),
            retention: Duration::from_secs(3600),
            capacity: 2,
        });

        for subject in ["a", "b", "c"] {
            recorder
                .record_exposure("org1", None, subject, "exp1", surface::REACT)
                .await
                .unwrap();
        }
        // "a" was evicted to make room for "c".
        let again = recorder
            .record_exposure("org1", None, "a", "exp1", surface::REACT)
            .await
            .unwrap();

        assert_eq!(again.status, ExposureStatus::Recorded);
        assert_eq!(sink.exposure_count(), 4);
        assert!(recorder.ledger().recorded_at.len() <= 2);
    }

    #[tokio::test]
    async fn ledger_stays_bounded_while_sink_fails() {
        let sink = Arc::new(RecordingTelemetry::failing());
        let recorder = ExposureRecorder::new(ExposureRecorderConfig {
            sink: sink.clone(),
            timeout: Duration::from_millis(300),
            retention: Duration::from_secs(3600),
            capacity: 10,
        });

        for attempt in 0..1_000 {
            let subject = ["a", "b", "c"][attempt % 3];
            let result = recorder
                .record_exposure("org1", None, subject, "exp1", surface::REACT)
                .await;
            assert_eq!(result, None);
        }

        let ledger = recorder.ledger();
        assert!(ledger.recorded_at.is_empty());
        assert!(ledger.order.len() <= 10, "queue grew to {}", ledger.order.len());
        drop(ledger);
        assert_eq!(recorder.stats().failures, 1_000);
    }

    #[test]
    fn released_claim_leaves_other_claims_in_order() {
        let mut ledger = ExposureLedger::default();
        let retention = chrono::Duration::hours(1);
        let start = Utc::now();
        let key = |subject: &str| ExposureKey {
            subject_key: subject.into(),
            experiment_key: "exp1".into(),
            surface: surface::REACT.into(),
        };

        assert!(ledger.reserve(&key("a"), start, retention, 10));
        assert!(ledger.reserve(&key("b"), start, retention, 10));
        ledger.release(&key("a"), start);

        assert_eq!(ledger.order.len(), 1);
        assert_eq!(ledger.order[0].0, key("b"));
        assert!(ledger.reserve(&key("a"), start, retention, 10));
        assert!(!ledger.reserve(&key("b"), start, retention, 10));
    }
}
