use std::sync::Arc;

use log::info;
use tracing::instrument;

use crate::checksum::{column_checksums, column_group_checksums, fold_block_checksums};
use crate::error::LoadError;
use crate::meta_tree::BlockMetaTree;
use crate::registry::LoadRegistry;
use crate::scheduler::MergeJobParams;
use crate::types::{
    CsnRange, LoadKind, LoadSchema, Table, TableClass, TableKey, TableKind, TabletLoadKey,
};
use crate::write_buffer::FrozenBuffer;

/// Converts frozen write buffers and prior intermediate segments for one
/// tablet into one contiguous, deduplicated, checksummed output table, and
/// publishes it into the tablet's table store.
///
/// The job tolerates re-invocation: an existing major short-circuits to
/// success, and re-merging inputs already reflected in the store produces
/// the same output again.
#[instrument(level = "debug", skip_all, fields(tablet_id = %params.tablet_id))]
pub(crate) async fn execute(
    registry: &Arc<LoadRegistry>,
    params: MergeJobParams,
) -> Result<(), LoadError> {
    let store = registry.table_store();
    let key = TabletLoadKey::new(params.tablet_id, params.kind);
    let meta = store
        .tablet_meta(params.tablet_id)
        .ok_or(LoadError::TabletMissing(params.tablet_id.value()))?;

    if params.kind == LoadKind::Full && meta.major.is_some() {
        info!(
            "major table already produced, nothing to merge [tablet_id={}]",
            params.tablet_id
        );
        if params.is_commit {
            registry.remove_context(key);
        }
        return Ok(());
    }

    let ctx = registry.context(key).ok_or(LoadError::Expired)?;
    let snapshot = ctx.merge_snapshot()?;
    if params.start_csn.is_set() && params.start_csn < snapshot.start_csn {
        return Err(LoadError::Expired);
    }
    if params.kind == LoadKind::Full
        && meta.load_start_csn.is_set()
        && meta.load_start_csn != snapshot.start_csn
    {
        // persisted campaign state belongs to a different attempt
        return Err(LoadError::Expired);
    }

    // Step 1: freeze everything below the requested boundary.
    let boundary = if params.rec_csn.is_set() {
        params.rec_csn
    } else {
        snapshot.commit_csn
    };
    if boundary.is_set() {
        ctx.buffers().freeze_up_to(boundary)?;
    }
    let frozen = ctx.buffers().frozen();

    let schema = ctx.ensure_schema()?;
    match params.kind {
        LoadKind::Full => {
            merge_full(registry, &ctx, &params, &snapshot.table_key, &schema, &meta, &frozen)?
        }
        LoadKind::Incremental => {
            merge_incremental(registry, &ctx, &params, &snapshot.table_key, &schema, &frozen)?
        }
    }

    if params.is_commit && store.first_major(params.tablet_id).is_some() {
        // the campaign is durable; the context is no longer needed
        registry.remove_context(key);
    }
    Ok(())
}

fn merge_full(
    registry: &Arc<LoadRegistry>,
    ctx: &Arc<crate::load_context::TabletLoadContext>,
    params: &MergeJobParams,
    table_key: &TableKey,
    schema: &LoadSchema,
    meta: &crate::tablestore::TabletMeta,
    frozen: &[Arc<FrozenBuffer>],
) -> Result<(), LoadError> {
    let segments = &meta.intermediates;
    if segments.is_empty() && frozen.is_empty() {
        return Err(LoadError::InvalidArgument("nothing to merge"));
    }

    // Step 2: the union of all contributions must chain without a gap.
    let span = compute_span(segments, frozen)?;
    let commit_csn = if meta.load_commit_csn.is_set() {
        meta.load_commit_csn
    } else {
        ctx.commit_csn()
    };
    if commit_csn.is_set() && span.end > commit_csn {
        return Err(LoadError::Unexpected("merge span beyond the commit csn"));
    }

    // Step 3: complete coverage of a committed campaign produces the major.
    let complete = params.is_commit
        && commit_csn.is_set()
        && span.start == ctx.start_csn().prev()
        && span.end == commit_csn;
    let class = if complete {
        TableClass::Major
    } else {
        TableClass::Intermediate
    };

    // Steps 4 and 5: deduplicated build plus checksums.
    let table = build_output(*table_key, class, span, schema, segments, frozen)?;
    info!(
        "merge produced table [tablet_id={}, class={:?}, csn_range={}, blocks={}, rows={}]",
        params.tablet_id,
        class,
        span,
        table.blocks.len(),
        table.row_count
    );

    // Step 6: atomic publish guarded by the rebuild seq.
    publish(registry, params, table)?;

    // Step 7: drop buffers the output fully absorbed.
    ctx.buffers().release_through(span.end);
    Ok(())
}

fn merge_incremental(
    registry: &Arc<LoadRegistry>,
    ctx: &Arc<crate::load_context::TabletLoadContext>,
    params: &MergeJobParams,
    table_key: &TableKey,
    schema: &LoadSchema,
    frozen: &[Arc<FrozenBuffer>],
) -> Result<(), LoadError> {
    if frozen.is_empty() {
        // everything already absorbed by an earlier invocation
        return Ok(());
    }
    let span = compute_span(&[], frozen)?;
    if registry
        .table_store()
        .tablet_meta(params.tablet_id)
        .ok_or(LoadError::TabletMissing(params.tablet_id.value()))?
        .deltas
        .iter()
        .any(|d| d.csn_range == span)
    {
        ctx.buffers().release_through(span.end);
        return Ok(());
    }
    let table = build_output(*table_key, TableClass::Delta, span, schema, &[], frozen)?;
    info!(
        "incremental merge produced delta [tablet_id={}, csn_range={}, rows={}]",
        params.tablet_id, span, table.row_count
    );
    publish(registry, params, table)?;
    ctx.buffers().release_through(span.end);
    Ok(())
}

fn publish(
    registry: &Arc<LoadRegistry>,
    params: &MergeJobParams,
    table: Table,
) -> Result<(), LoadError> {
    let store = registry.table_store();
    loop {
        let rebuild_seq = store.rebuild_seq(params.tablet_id)?;
        match store.publish_table(params.tablet_id, table.clone(), rebuild_seq) {
            Err(LoadError::RebuildSeqMismatch { .. }) => continue,
            other => return other,
        }
    }
}

/// Computes the minimal csn span fully covered by the sorted segments and
/// frozen buffers. Any gap between adjacent contributions, or between the
/// segment chain and the buffer chain, is an unrecoverable consistency
/// fault, not a retryable error.
pub(crate) fn compute_span(
    segments: &[Table],
    frozen: &[Arc<FrozenBuffer>],
) -> Result<CsnRange, LoadError> {
    let mut segment_ranges: Vec<CsnRange> = segments.iter().map(|s| s.csn_range).collect();
    segment_ranges.sort_by_key(|r| r.start);
    let mut buffer_ranges: Vec<CsnRange> = frozen.iter().map(|b| b.range()).collect();
    buffer_ranges.sort_by_key(|r| r.start);

    let segment_span = check_chain(&segment_ranges)?;
    let buffer_span = check_chain(&buffer_ranges)?;
    match (segment_span, buffer_span) {
        (None, None) => Err(LoadError::InvalidArgument("nothing to merge")),
        (Some(span), None) => Ok(span),
        (None, Some(span)) => Ok(span),
        (Some(seg), Some(buf)) => {
            // buffers are strictly newer than persisted segments for the
            // same tablet; their chain must attach to the segment chain
            if buf.start < seg.start || buf.start > seg.end || buf.end < seg.end {
                return Err(LoadError::CsnRangeGap {
                    covered_end: seg.end,
                    next_start: buf.start,
                });
            }
            Ok(CsnRange::new(seg.start.min(buf.start), seg.end.max(buf.end)))
        }
    }
}

fn check_chain(ranges: &[CsnRange]) -> Result<Option<CsnRange>, LoadError> {
    let Some(first) = ranges.first() else {
        return Ok(None);
    };
    let mut covered = *first;
    for range in &ranges[1..] {
        if range.start > covered.end {
            return Err(LoadError::CsnRangeGap {
                covered_end: covered.end,
                next_start: range.start,
            });
        }
        covered.end = covered.end.max(range.end);
    }
    covered.start = covered.start.min(first.start);
    Ok(Some(covered))
}

/// Step 4: merges all contributing blocks through an end-key-indexed meta
/// tree, discarding exact end-key duplicates; column-oriented output is
/// built independently per column group and assembled into the composite.
pub(crate) fn build_output(
    key: TableKey,
    class: TableClass,
    span: CsnRange,
    schema: &LoadSchema,
    segments: &[Table],
    frozen: &[Arc<FrozenBuffer>],
) -> Result<Table, LoadError> {
    let mut tree = BlockMetaTree::new();
    for segment in segments {
        tree.insert_all(segment.blocks.iter().cloned());
    }
    for buffer in frozen {
        tree.insert_all(buffer.base_blocks().iter().cloned());
    }
    let blocks = tree.sorted_blocks();
    let row_count: u64 = blocks.iter().map(|b| b.row_count()).sum();
    let checksum = fold_block_checksums(&blocks);

    let mut column_groups = Vec::new();
    let sums;
    if schema.is_column_oriented() && key.kind == TableKind::ColumnOriented {
        let mut group_blocks_all = Vec::with_capacity(schema.column_groups.len());
        for idx in 0..schema.column_groups.len() {
            let mut cg_tree = BlockMetaTree::new();
            for segment in segments {
                if let Some(cg) = segment.column_groups.get(idx) {
                    cg_tree.insert_all(cg.blocks.iter().cloned());
                }
            }
            for buffer in frozen {
                cg_tree.insert_all(buffer.column_group_blocks(idx as u16).iter().cloned());
            }
            let cg_blocks = cg_tree.sorted_blocks();
            let cg_row_count: u64 = cg_blocks.iter().map(|b| b.row_count()).sum();
            let cg_checksum = fold_block_checksums(&cg_blocks);
            column_groups.push(Table {
                key: TableKey {
                    tablet_id: key.tablet_id,
                    kind: TableKind::ColumnGroup(idx as u16),
                    snapshot_version: key.snapshot_version,
                },
                class,
                csn_range: span,
                blocks: cg_blocks.clone(),
                row_count: cg_row_count,
                checksum: cg_checksum,
                column_checksums: Vec::new(),
                column_groups: Vec::new(),
            });
            group_blocks_all.push(cg_blocks);
        }
        sums = column_group_checksums(schema, &group_blocks_all);
    } else {
        sums = column_checksums(&blocks, schema.column_count);
    }

    Ok(Table {
        key,
        class,
        csn_range: span,
        blocks,
        row_count,
        checksum,
        column_checksums: sums,
        column_groups,
    })
}
