//! Level compaction: when a level outgrows its budget, merge a slice of it
//! (plus everything it overlaps in the next level) downward.

use crate::error::Result;
use crate::invariant;
use crate::manifest::{Entry, Manifest};
use crate::sstable::merger::Merger;
use crate::sstable::Metadata;

use std::path::Path;

/// Level 0 compacts once it holds this many files.
pub const LEVEL0_FILE_THRESHOLD: usize = 4;

/// Level L > 0 compacts once its aggregate size exceeds 10^L times this.
pub const LEVEL_SIZE_BASE: u64 = 1_000_000;

/// One level's worth of compaction work: the source level and the inputs
/// (newest first) that will be merged into the next level.
#[derive(Debug)]
pub struct Plan {
    pub level: usize,
    pub candidates: Vec<Metadata>,
}

pub struct Compactor<'a> {
    db_name: &'a str,
    db_dir: &'a Path,
}

impl<'a> Compactor<'a> {
    pub fn new(db_name: &'a str, db_dir: &'a Path) -> Self {
        Self { db_name, db_dir }
    }

    /// Runs one full compaction pass, lowest level first. Each level that
    /// crosses its threshold is merged into the next; a merge can push the
    /// next level over its own budget, so the walk continues from there.
    pub fn compact(&self, manifest: &mut Manifest) -> Result<()> {
        let mut level = 0;
        while let Some(plan) = self.next_plan(manifest, level)? {
            let outputs = self.execute(&plan)?;
            level = plan.level + 1;
            self.finalize(manifest, plan, &outputs)?;
        }
        Ok(())
    }

    /// Finds the first level at or above `start_level` that needs
    /// compacting, and selects its merge inputs.
    pub fn next_plan(&self, manifest: &Manifest, start_level: usize) -> Result<Option<Plan>> {
        for level in start_level..manifest.levels() {
            if self.should_compact(manifest, level)? {
                return Ok(Some(Plan {
                    level,
                    candidates: self.merge_candidates(manifest, level)?,
                }));
            }
        }
        Ok(None)
    }

    /// Merges the plan's inputs into new files at the next level. Touches
    /// only immutable files, so callers need no lock here.
    pub fn execute(&self, plan: &Plan) -> Result<Vec<Metadata>> {
        tracing::info!(
            level = plan.level,
            inputs = plan.candidates.len(),
            "compacting level into level {}",
            plan.level + 1
        );

        Merger::new(
            &plan.candidates,
            (plan.level + 1) as u8,
            self.db_name,
            self.db_dir,
        )
        .merge()
    }

    /// Publishes a finished merge: one manifest batch retiring every input
    /// and recording every output, a sync, and only then the input files
    /// unlinked. Callers must hold the engine's exclusive lock so readers
    /// observe either the old or the new table set, never a mix.
    pub fn finalize(
        &self,
        manifest: &mut Manifest,
        plan: Plan,
        outputs: &[Metadata],
    ) -> Result<()> {
        for meta in &plan.candidates {
            manifest.add_entry(Entry::deleted(meta.clone()))?;
        }
        for meta in outputs {
            manifest.add_entry(Entry::live(meta.clone()))?;
        }
        manifest.sync()?;

        for meta in &plan.candidates {
            if let Err(err) = std::fs::remove_file(self.db_dir.join(&meta.filename)) {
                tracing::warn!(
                    filename = %meta.filename,
                    error = %err,
                    "failed to delete compacted sstable"
                );
            }
        }

        tracing::info!(
            level = plan.level,
            inputs = plan.candidates.len(),
            outputs = outputs.len(),
            "compaction pass complete"
        );

        Ok(())
    }

    fn should_compact(&self, manifest: &Manifest, level: usize) -> Result<bool> {
        if level == 0 {
            return Ok(manifest.metadata_for_level(0).len() >= LEVEL0_FILE_THRESHOLD);
        }

        let mut total = 0u64;
        for meta in manifest.metadata_for_level(level) {
            total += std::fs::metadata(self.db_dir.join(&meta.filename))?.len();
        }
        Ok(total > LEVEL_SIZE_BASE * 10u64.pow(level as u32))
    }

    /// Selects the inputs for compacting `level`, ordered most recent first:
    /// the level-L slice (all of L0, or the head of the manifest's list for
    /// L > 0), then every level-L+1 file whose key range intersects the
    /// slice's combined range.
    fn merge_candidates(&self, manifest: &Manifest, level: usize) -> Result<Vec<Metadata>> {
        let level_tables = manifest.metadata_for_level(level);
        if level_tables.is_empty() {
            return Err(invariant!(
                "compaction selected empty level {level} as its source"
            ));
        }

        let mut candidates: Vec<Metadata> = if level == 0 {
            // Manifest order is oldest-first; the merger wants newest-first.
            level_tables.iter().rev().cloned().collect()
        } else {
            vec![level_tables[0].clone()]
        };

        let mut lo = candidates[0].start_key.clone();
        let mut hi = candidates[0].end_key.clone();
        for meta in &candidates[1..] {
            if meta.start_key < lo {
                lo = meta.start_key.clone();
            }
            if meta.end_key > hi {
                hi = meta.end_key.clone();
            }
        }

        for meta in manifest.metadata_for_level(level + 1) {
            if meta.start_key.as_slice() <= hi.as_slice() && lo.as_slice() <= meta.end_key.as_slice()
            {
                candidates.push(meta.clone());
            }
        }

        Ok(candidates)
    }
}
