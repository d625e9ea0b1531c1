//! Query filters for strand reads.
//!
//! Supports conjunctions over kind, scope keys, time window, tag membership
//! and cluster-slot containment. Default ordering is `created_at DESC`.

use chrono::{DateTime, Utc};

use crate::models::{ClusterType, StrandKind, Timeframe, TrackingStatus};

#[derive(Debug, Clone, Default)]
pub struct StrandFilter {
    pub kind: Option<StrandKind>,
    pub symbol: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub braid_level: Option<u32>,
    pub tracking_status: Option<TrackingStatus>,
    pub tag: Option<String>,
    pub group_signature: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Containment: strand must carry a slot matching this triple.
    pub cluster: Option<ClusterFilter>,
    pub limit: Option<usize>,
    /// Oldest-first instead of the default newest-first.
    pub ascending: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterFilter {
    pub cluster_type: ClusterType,
    pub cluster_key: String,
    pub braid_level: u32,
    pub unconsumed_only: bool,
}

impl StrandFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: StrandKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn timeframe(mut self, timeframe: Timeframe) -> Self {
        self.timeframe = Some(timeframe);
        self
    }

    pub fn braid_level(mut self, level: u32) -> Self {
        self.braid_level = Some(level);
        self
    }

    pub fn tracking_status(mut self, status: TrackingStatus) -> Self {
        self.tracking_status = Some(status);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn group_signature(mut self, signature: impl Into<String>) -> Self {
        self.group_signature = Some(signature.into());
        self
    }

    pub fn since(mut self, t: DateTime<Utc>) -> Self {
        self.since = Some(t);
        self
    }

    pub fn until(mut self, t: DateTime<Utc>) -> Self {
        self.until = Some(t);
        self
    }

    pub fn in_cluster(
        mut self,
        cluster_type: ClusterType,
        cluster_key: impl Into<String>,
        braid_level: u32,
    ) -> Self {
        self.cluster = Some(ClusterFilter {
            cluster_type,
            cluster_key: cluster_key.into(),
            braid_level,
            unconsumed_only: false,
        });
        self
    }

    pub fn unconsumed_in_cluster(
        mut self,
        cluster_type: ClusterType,
        cluster_key: impl Into<String>,
        braid_level: u32,
    ) -> Self {
        self.cluster = Some(ClusterFilter {
            cluster_type,
            cluster_key: cluster_key.into(),
            braid_level,
            unconsumed_only: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.ascending = true;
        self
    }
}
