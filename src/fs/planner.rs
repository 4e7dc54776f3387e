//! Pure multipart upload planning.
//!
//! The planner walks the file in slabs of `max_part_size` starting at offset
//! zero; part numbers are determined by offset alone. For each slab it
//! decides, from the untreated ranges and the already-submitted parts,
//! whether the slab is already covered, can be server-side copied, must be
//! downloaded and re-uploaded, or supersedes an existing part. It never
//! mutates coordinator state; callers apply `to_cancel` themselves.

use crate::fs::page_list::ByteRange;
use crate::{Error, Result};

/// Planner view of a submitted upload part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartView {
    pub part_num: u32,
    pub start: u64,
    pub size: u64,
    /// True once the worker finished and the etag is recorded.
    pub uploaded: bool,
}

impl PartView {
    fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// A planned part: bytes to send or to copy server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub start: u64,
    pub size: u64,
    pub part_num: u32,
}

/// Store-imposed limits the planner must respect.
#[derive(Debug, Clone, Copy)]
pub struct PartPolicy {
    pub max_part_size: u64,
    pub min_part_size: u64,
    pub max_copy_size: u64,
    pub use_copy: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UploadPlan {
    pub to_upload: Vec<PartPlan>,
    pub to_copy: Vec<PartPlan>,
    pub to_download: Vec<ByteRange>,
    /// Part numbers superseded by new uploads.
    pub to_cancel: Vec<u32>,
    /// True when a canceled part may still be in flight; the caller must
    /// join outstanding workers before submitting the replacement.
    pub wait_upload_complete: bool,
}

impl UploadPlan {
    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty() && self.to_copy.is_empty() && self.to_cancel.is_empty()
    }
}

/// Plan submitted by the streaming flush path for one slab-aligned interval.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BoundaryPlan {
    pub to_upload: Vec<PartPlan>,
    pub to_cancel: Vec<u32>,
    pub wait_upload_complete: bool,
    /// The interval the upload entries cover, possibly extended past the
    /// untreated run by absorbing canceled parts.
    pub assigned: ByteRange,
}

/// Plan the full set of actions that bring the remote object in line with
/// the local buffer. `parts` must be the active (non-canceled) parts sorted
/// by start offset; `untreated` the coalesced dirty ranges sorted by start.
pub fn plan_whole_file(
    parts: &[PartView],
    untreated: &[ByteRange],
    file_size: u64,
    policy: &PartPolicy,
) -> Result<UploadPlan> {
    let max = policy.max_part_size;
    let mut plan = UploadPlan::default();

    // Working copy of the untreated list; ranges are consumed slab by slab.
    let mut pending: std::collections::VecDeque<ByteRange> = untreated
        .iter()
        .filter(|r| r.size > 0 && r.start < file_size)
        .map(|r| ByteRange::new(r.start, r.size.min(file_size - r.start)))
        .collect();

    let mut cur_start = 0u64;
    while cur_start < file_size {
        let cur_size = max.min(file_size - cur_start);
        let cur_end = cur_start + cur_size;
        let part_num = (cur_start / max) as u32 + 1;

        // Untreated ranges clipped to this slab.
        let mut cur_untreated: Vec<ByteRange> = Vec::new();
        while let Some(front) = pending.front_mut() {
            if front.start >= cur_end {
                break;
            }
            if front.end() <= cur_start {
                pending.pop_front();
                continue;
            }
            let clipped_start = front.start.max(cur_start);
            if front.end() <= cur_end {
                cur_untreated.push(ByteRange::new(clipped_start, front.end() - clipped_start));
                pending.pop_front();
            } else {
                cur_untreated.push(ByteRange::new(clipped_start, cur_end - clipped_start));
                front.size = front.end() - cur_end;
                front.start = cur_end;
                break;
            }
        }

        // At most one submitted part may overlap a slab; parts are planned
        // slab-aligned, so two overlaps mean the list is corrupt.
        let mut overlap: Option<&PartView> = None;
        for part in parts {
            if part.start < cur_end && cur_start < part.end() {
                if overlap.is_some() {
                    return Err(Error::Invariant(format!(
                        "upload parts are not aligned to the {max} byte slab at offset {cur_start}"
                    ))
                    .into());
                }
                overlap = Some(part);
            }
        }

        match (cur_untreated.is_empty(), overlap) {
            // Slab already uploaded and untouched since.
            (true, Some(_)) => {}
            (true, None) => {
                if policy.use_copy {
                    plan.to_copy.push(PartPlan {
                        start: cur_start,
                        size: cur_size,
                        part_num,
                    });
                } else {
                    plan.to_download.push(ByteRange::new(cur_start, cur_size));
                    plan.to_upload.push(PartPlan {
                        start: cur_start,
                        size: cur_size,
                        part_num,
                    });
                }
            }
            // The slab was uploaded but has been dirtied since: the old part
            // is superseded, and the whole slab (all of it local) goes again.
            (false, Some(part)) => {
                if !part.uploaded {
                    plan.wait_upload_complete = true;
                }
                plan.to_cancel.push(part.part_num);
                plan.to_upload.push(PartPlan {
                    start: cur_start,
                    size: cur_size,
                    part_num,
                });
            }
            // Dirty slab with no submitted part: gaps around the untreated
            // ranges are fetched, or the leading gap is absorbed into the
            // preceding copy when the limits allow it.
            (false, None) => {
                plan_dirty_slab(&mut plan, &cur_untreated, cur_start, cur_size, part_num, policy);
            }
        }

        cur_start = cur_end;
    }

    Ok(plan)
}

fn plan_dirty_slab(
    plan: &mut UploadPlan,
    cur_untreated: &[ByteRange],
    cur_start: u64,
    cur_size: u64,
    part_num: u32,
    policy: &PartPolicy,
) {
    let mut rest_start = cur_start;
    let mut rest_size = cur_size;
    let mut upload_start = cur_start;
    let mut upload_size = cur_size;
    let mut first_gap = true;

    for range in cur_untreated {
        if rest_start < range.start {
            let gap = range.start - rest_start;
            let mut absorbed = false;
            if first_gap && policy.use_copy {
                // The gap can join the previous copy part when the combined
                // copy stays under the single-copy limit and the trimmed
                // upload still satisfies the minimum part size.
                if let Some(prev_copy) = plan.to_copy.last_mut() {
                    if prev_copy.start + prev_copy.size == rest_start
                        && prev_copy.size + gap <= policy.max_copy_size
                        && (rest_start + rest_size) - range.start >= policy.min_part_size
                    {
                        prev_copy.size += gap;
                        upload_size -= range.start - upload_start;
                        upload_start = range.start;
                        absorbed = true;
                    }
                }
            }
            if !absorbed {
                plan.to_download.push(ByteRange::new(rest_start, gap));
            }
        }
        rest_size = (rest_start + rest_size) - range.end();
        rest_start = range.end();
        first_gap = false;
    }

    if rest_size > 0 {
        plan.to_download.push(ByteRange::new(rest_start, rest_size));
    }
    plan.to_upload.push(PartPlan {
        start: upload_start,
        size: upload_size,
        part_num,
    });
}

/// Streaming-flush variant: given the last untreated run already ceil-aligned
/// by the caller, emit full slabs covering it. Submitted parts overlapping
/// the aligned interval are canceled and absorbed, extending the interval
/// when a canceled part reaches past its end.
pub fn plan_boundary_slab(
    parts: &[PartView],
    aligned_start: u64,
    aligned_size: u64,
    max_part_size: u64,
) -> Result<BoundaryPlan> {
    if aligned_size == 0 {
        return Ok(BoundaryPlan::default());
    }
    if aligned_start % max_part_size != 0 {
        return Err(Error::Invariant(format!(
            "boundary upload start {aligned_start} is not aligned to {max_part_size}"
        ))
        .into());
    }

    let mut plan = BoundaryPlan::default();
    let mut end = aligned_start + aligned_size;

    for part in parts {
        if part.start < end && aligned_start < part.end() {
            if part.end() > end {
                end = part.end();
            }
            if !part.uploaded {
                plan.wait_upload_complete = true;
            }
            plan.to_cancel.push(part.part_num);
        }
    }

    let mut slab_start = aligned_start;
    while slab_start + max_part_size <= end {
        plan.to_upload.push(PartPlan {
            start: slab_start,
            size: max_part_size,
            part_num: (slab_start / max_part_size) as u32 + 1,
        });
        slab_start += max_part_size;
    }
    if slab_start < end {
        // Only a short (non-slab-sized) part can leave a tail here, and the
        // streaming path never produces one.
        return Err(Error::Invariant(format!(
            "canceled part leaves {} uncovered bytes past offset {slab_start}",
            end - slab_start
        ))
        .into());
    }
    plan.assigned = ByteRange::new(aligned_start, slab_start - aligned_start);

    Ok(plan)
}

/// Ceil-align the start of an untreated run to the slab size and floor-align
/// its length; returns None when no whole slab fits.
pub fn align_untreated_run(run: ByteRange, max_part_size: u64) -> Option<ByteRange> {
    let aligned_start = run.start.div_ceil(max_part_size) * max_part_size;
    if run.end() <= aligned_start {
        return None;
    }
    let aligned_size = ((run.end() - aligned_start) / max_part_size) * max_part_size;
    if aligned_size == 0 {
        return None;
    }
    Some(ByteRange::new(aligned_start, aligned_size))
}
