//! Per-session counters.
//!
//! Counters are atomics so concurrent turns can record without a lock.  Only
//! the runtime's turn-completion and image paths write to them.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::{Classification, UrgencyLevel, UserType};

#[derive(Debug)]
pub struct SessionStats {
    started_at: DateTime<Utc>,
    queries: AtomicU64,
    emergencies: AtomicU64,
    professional_queries: AtomicU64,
    patient_queries: AtomicU64,
    images_analyzed: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub queries: u64,
    pub emergencies: u64,
    pub professional_queries: u64,
    pub patient_queries: u64,
    pub images_analyzed: u64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            queries: AtomicU64::new(0),
            emergencies: AtomicU64::new(0),
            professional_queries: AtomicU64::new(0),
            patient_queries: AtomicU64::new(0),
            images_analyzed: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_query(&self, classification: &Classification) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        match classification.user_type {
            UserType::Professional => self.professional_queries.fetch_add(1, Ordering::Relaxed),
            UserType::Patient => self.patient_queries.fetch_add(1, Ordering::Relaxed),
        };
        if classification.urgency == UrgencyLevel::Emergency {
            self.emergencies.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_image(&self) {
        self.images_analyzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            started_at: self.started_at,
            queries: self.queries.load(Ordering::Relaxed),
            emergencies: self.emergencies.load(Ordering::Relaxed),
            professional_queries: self.professional_queries.load(Ordering::Relaxed),
            patient_queries: self.patient_queries.load(Ordering::Relaxed),
            images_analyzed: self.images_analyzed.load(Ordering::Relaxed),
        }
    }
}
