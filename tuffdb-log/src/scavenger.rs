//! Scavenger: space reclamation for completed chunks.
//!
//! Each completed chunk (or, with merging, each run of adjacent completed
//! chunks that fits one chunk's capacity) is rewritten into a temp file
//! holding only the records a relevance predicate keeps, along with the
//! position map translating pre-scavenge positions. The candidate is then
//! renamed to the next version and swapped into the database; readers
//! never observe a partially scavenged chunk, and a crash at any point
//! leaves the previous version selectable.

use crate::chunk::{AppendResult, Chunk, ChunkHeader, PosMapEntry};
use crate::db::ChunkDb;
use crate::error::LogError;
use crate::record::LogRecord;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Answers whether a stream's records are still needed.
pub type RelevanceFn = dyn Fn(&str) -> bool + Send + Sync;

/// Totals for one scavenge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScavengeSummary {
    pub chunks_processed: usize,
    pub chunks_rewritten: usize,
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    /// Net disk bytes reclaimed; negative when rewrites grew the files.
    pub bytes_saved: i64,
}

enum GroupOutcome {
    Rewritten { bytes_saved: i64 },
    Skipped,
}

pub struct Scavenger {
    db: Arc<ChunkDb>,
    relevance: Arc<RelevanceFn>,
    always_keep_scavenged: bool,
    merge_chunks: bool,
}

impl Scavenger {
    pub fn new(db: Arc<ChunkDb>, relevance: Arc<RelevanceFn>) -> Self {
        Self {
            db,
            relevance,
            always_keep_scavenged: false,
            merge_chunks: false,
        }
    }

    /// Keep rewritten chunks even when they save no space.
    pub fn with_always_keep_scavenged(mut self, keep: bool) -> Self {
        self.always_keep_scavenged = keep;
        self
    }

    /// Rewrite runs of adjacent completed chunks as single spanning chunks.
    pub fn with_merge_chunks(mut self, merge: bool) -> Self {
        self.merge_chunks = merge;
        self
    }

    /// Rewrites every completed chunk, leaving failures behind untouched.
    pub fn scavenge(&self) -> Result<ScavengeSummary, LogError> {
        let completed: Vec<Arc<Chunk>> = self
            .db
            .chunks()
            .into_iter()
            .filter(|c| c.is_completed())
            .collect();
        let groups = self.plan_groups(&completed);

        let mut summary = ScavengeSummary::default();
        // Transactions whose prepares this run dropped; their commits are
        // dropped too.
        let mut dropped_transactions: HashSet<u64> = HashSet::new();

        for group in &groups {
            summary.chunks_processed += group.len();
            match self.scavenge_group(group, &mut dropped_transactions) {
                Ok(GroupOutcome::Rewritten { bytes_saved }) => {
                    summary.chunks_rewritten += group.len();
                    summary.bytes_saved += bytes_saved;
                }
                Ok(GroupOutcome::Skipped) => summary.chunks_skipped += group.len(),
                Err(e) => {
                    tracing::warn!(
                        "scavenge of chunks {}..{} failed, keeping originals: {}",
                        group.first().map(|c| c.header().chunk_start_number).unwrap_or(0),
                        group.last().map(|c| c.header().chunk_end_number).unwrap_or(0),
                        e
                    );
                    summary.chunks_failed += group.len();
                }
            }
        }

        tracing::info!(
            "scavenge finished: {} chunk(s) processed, {} rewritten, {} skipped, {} failed, {} bytes saved",
            summary.chunks_processed,
            summary.chunks_rewritten,
            summary.chunks_skipped,
            summary.chunks_failed,
            summary.bytes_saved
        );
        Ok(summary)
    }

    /// Groups completed chunks for rewriting. Without merging, one chunk
    /// per group; with merging, greedy runs of adjacent chunks whose
    /// combined physical data fits a single chunk's capacity.
    fn plan_groups(&self, completed: &[Arc<Chunk>]) -> Vec<Vec<Arc<Chunk>>> {
        if !self.merge_chunks {
            return completed.iter().map(|c| vec![c.clone()]).collect();
        }
        let capacity = self.db.config().chunk_data_size as u64;
        let mut groups: Vec<Vec<Arc<Chunk>>> = Vec::new();
        let mut current: Vec<Arc<Chunk>> = Vec::new();
        let mut current_bytes = 0u64;
        for chunk in completed {
            let bytes = chunk.physical_data_size();
            let adjacent = current
                .last()
                .map(|p| p.header().chunk_end_number + 1 == chunk.header().chunk_start_number)
                .unwrap_or(false);
            if !current.is_empty() && adjacent && current_bytes + bytes <= capacity {
                current.push(chunk.clone());
                current_bytes += bytes;
            } else {
                if !current.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
                current.push(chunk.clone());
                current_bytes = bytes;
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    fn scavenge_group(
        &self,
        group: &[Arc<Chunk>],
        dropped_transactions: &mut HashSet<u64>,
    ) -> Result<GroupOutcome, LogError> {
        let naming = self.db.naming();
        let config = self.db.config();
        let start = group[0].header().chunk_start_number;
        let end = group[group.len() - 1].header().chunk_end_number;

        // Keep the sources alive for the whole rewrite.
        let guards: Vec<_> = group
            .iter()
            .map(|c| c.acquire_reader())
            .collect::<Result<_, _>>()?;

        let mut new_version = 0;
        for number in start..=end {
            if let Some((version, _)) = naming.versions_for(number)?.first() {
                new_version = new_version.max(version + 1);
            }
        }

        let temp_path = naming.temp_filename();
        let output = Chunk::create(
            &temp_path,
            ChunkHeader::new_scavenged(start, end, config.chunk_data_size),
        )?;

        let copied = self.copy_relevant(group, &output, dropped_transactions);
        let (map, logical_size, kept, dropped) = match copied {
            Ok(v) => v,
            Err(e) => return Err(discard(&temp_path, e)),
        };
        if let Err(e) = output.complete_scavenged(&map, logical_size) {
            return Err(discard(&temp_path, e));
        }

        let new_size = match output.file_size() {
            Ok(size) => size,
            Err(e) => return Err(discard(&temp_path, e)),
        };
        let mut old_size = 0u64;
        for chunk in group {
            match chunk.file_size() {
                Ok(size) => old_size += size,
                Err(e) => return Err(discard(&temp_path, e)),
            }
        }

        if group.len() == 1 && !self.always_keep_scavenged && new_size >= old_size {
            drop(output);
            std::fs::remove_file(&temp_path)?;
            tracing::info!(
                "scavenge of chunk {} saved nothing ({} bytes), keeping the original",
                group[0].file_name(),
                old_size
            );
            return Ok(GroupOutcome::Skipped);
        }

        let final_path = naming.filename(start, new_version);
        drop(output);
        if let Err(e) = std::fs::rename(&temp_path, &final_path) {
            return Err(discard(&temp_path, e.into()));
        }
        let new_chunk = Arc::new(Chunk::open_completed(&final_path, false)?);

        drop(guards);
        self.db.swap_scavenged_chunk(new_chunk.clone())?;

        tracing::info!(
            "scavenged chunks {}..{} into {}: kept {}, dropped {}, {} -> {} bytes",
            start,
            end,
            new_chunk.file_name(),
            kept,
            dropped,
            old_size,
            new_size
        );
        Ok(GroupOutcome::Rewritten {
            bytes_saved: old_size as i64 - new_size as i64,
        })
    }

    /// Copies the group's relevant records into `output`, building the
    /// position map relative to the group's logical start.
    fn copy_relevant(
        &self,
        group: &[Arc<Chunk>],
        output: &Chunk,
        dropped_transactions: &mut HashSet<u64>,
    ) -> Result<(Vec<PosMapEntry>, u64, usize, usize), LogError> {
        let group_base = group[0].header().logical_start();
        let mut map = Vec::new();
        let mut kept = 0usize;
        let mut dropped = 0usize;

        for chunk in group {
            let chunk_base = chunk.header().logical_start();
            let mut position = 0u64;
            while let Some(read) = chunk.try_read_closest_forward(position)? {
                if self.keep_record(&read.record, dropped_transactions) {
                    match output.try_append(&read.record)? {
                        AppendResult::Written { old_position, .. } => {
                            map.push(PosMapEntry {
                                log_position: chunk_base - group_base + read.log_position,
                                physical_position: old_position as u32,
                            });
                            kept += 1;
                        }
                        AppendResult::Full => {
                            return Err(LogError::InvalidOperation(format!(
                                "scavenge output for chunks {}..{} overflowed its capacity",
                                group[0].header().chunk_start_number,
                                chunk.header().chunk_end_number
                            )));
                        }
                    }
                } else {
                    if let LogRecord::Prepare(prepare) = &read.record {
                        dropped_transactions.insert(prepare.transaction_position);
                    }
                    dropped += 1;
                }
                position = read.next_position;
            }
        }

        let last = &group[group.len() - 1];
        let logical_size =
            last.header().logical_start() - group_base + last.logical_data_size();
        Ok((map, logical_size, kept, dropped))
    }

    fn keep_record(&self, record: &LogRecord, dropped_transactions: &HashSet<u64>) -> bool {
        match record {
            LogRecord::Prepare(prepare) => (self.relevance)(&prepare.stream_id),
            LogRecord::Commit(commit) => {
                if dropped_transactions.contains(&commit.transaction_position) {
                    return false;
                }
                // Resolve through the prepare; a commit whose transaction
                // cannot be read anymore is kept.
                match self.db.try_read_at(commit.transaction_position) {
                    Ok(Some(read)) => match read.record {
                        LogRecord::Prepare(prepare) => (self.relevance)(&prepare.stream_id),
                        _ => true,
                    },
                    Ok(None) | Err(_) => true,
                }
            }
            LogRecord::System(_) => true,
        }
    }
}

fn discard(temp_path: &Path, error: LogError) -> LogError {
    if let Err(e) = std::fs::remove_file(temp_path) {
        tracing::warn!(
            "failed to remove scavenge temp file {}: {}",
            temp_path.display(),
            e
        );
    }
    error
}
