//! Pipeline stages, cooperative cancellation and in-stage progress reporting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// A node of the generation task graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Heightmap,
    Biome,
    Hydrology,
    Poi,
    Roads,
    Placement,
    Caves,
    Resources,
}

impl Stage {
    /// Every stage in dispatch-priority order.
    pub const ALL: [Stage; 8] = [
        Stage::Heightmap,
        Stage::Biome,
        Stage::Hydrology,
        Stage::Caves,
        Stage::Resources,
        Stage::Poi,
        Stage::Roads,
        Stage::Placement,
    ];

    /// Stages that must complete before this one may start.
    pub const fn dependencies(self) -> &'static [Stage] {
        match self {
            Stage::Heightmap => &[],
            Stage::Biome => &[Stage::Heightmap],
            Stage::Hydrology => &[Stage::Biome],
            Stage::Caves => &[Stage::Biome],
            Stage::Resources => &[Stage::Hydrology],
            Stage::Poi => &[Stage::Hydrology],
            Stage::Roads => &[Stage::Poi],
            Stage::Placement => &[Stage::Roads],
        }
    }

    /// Position in [`Stage::ALL`].
    pub fn index(self) -> usize {
        Stage::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Stage::Heightmap => "heightmap",
            Stage::Biome => "biome",
            Stage::Hydrology => "hydrology",
            Stage::Poi => "poi",
            Stage::Roads => "roads",
            Stage::Placement => "placement",
            Stage::Caves => "caves",
            Stage::Resources => "resources",
        }
    }
}

/// Shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type ProgressFn = dyn Fn(f32) + Send + Sync;

/// Per-stage execution context: cancellation plus a progress callback.
///
/// Stages call [`StageContext::check`] at row bands, tiles, POI pairs and
/// entrances, and [`StageContext::report`] at bounded intervals.
#[derive(Clone)]
pub struct StageContext {
    cancel: CancelToken,
    progress: Arc<ProgressFn>,
}

impl StageContext {
    pub fn new(cancel: CancelToken, progress: Arc<ProgressFn>) -> Self {
        Self { cancel, progress }
    }

    /// Context that is never cancelled and drops progress updates.
    pub fn detached() -> Self {
        Self {
            cancel: CancelToken::new(),
            progress: Arc::new(|_| {}),
        }
    }

    /// Return `Err(Cancelled)` if cancellation was requested.
    #[inline]
    pub fn check(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Report the fraction of the current stage that is done.
    pub fn report(&self, fraction: f32) {
        (self.progress)(fraction.clamp(0.0, 1.0));
    }

    /// Report `done / total` every `every` units, and at the end.
    pub fn report_every(&self, done: usize, total: usize, every: usize) {
        if total > 0 && (done % every.max(1) == 0 || done == total) {
            self.report(done as f32 / total as f32);
        }
    }
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
