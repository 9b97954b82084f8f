use serde::Serialize;

/// Per-frame counters, filled by `update` and completed by `record`/`wait_record`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameStats {
    /// Logical frame number (number of updates so far)
    pub frame: u64,
    /// Ring slot written this frame
    pub slot: usize,
    /// (light, camera) pairs whose shadow views were recomputed
    pub cascade_updates: u32,
    /// Uniform blocks written into the current slot
    pub uniform_uploads: u32,
    /// Shadow recording jobs submitted
    pub shadow_jobs: u32,
    /// Camera recording jobs submitted
    pub camera_jobs: u32,
    /// Meshes skipped by frustum culling, summed over cameras
    pub draws_culled: u32,
    /// Draw calls encoded by all jobs
    pub draws_recorded: u32,
    /// Mesh bundles destroyed from the removal queue
    pub meshes_removed: u32,
}

impl FrameStats {
    pub fn total_jobs(&self) -> u32 {
        self.shadow_jobs + self.camera_jobs
    }

    /// One-line summary for logs.
    pub fn format(&self) -> String {
        format!(
            "frame {} (slot {}): {} shadow + {} camera jobs, {} draws ({} culled), {} cascades, {} uploads",
            self.frame,
            self.slot,
            self.shadow_jobs,
            self.camera_jobs,
            self.draws_recorded,
            self.draws_culled,
            self.cascade_updates,
            self.uniform_uploads
        )
    }
}
