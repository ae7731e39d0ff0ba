//! The external sort and the streaming set operations that close one
//! frame group: RAM-sized run sort, k-way merge with inline dedup, and
//! sorted-stream subtraction.

use crate::config::SearchConfig;
use crate::disk::{InputStream, OutputStream};
use crate::error::SiftError;
use crate::files::{self, Layout};
use crate::heap::MergeHeap;
use crate::problem::{FrameGroup, PackedState};
use crate::stream::{NodeReader, NodeSource, NodeWriter};

/// Compact a sorted run in place: payload-equal neighbours collapse to
/// one record carrying the smallest subframe. Returns the kept length.
pub fn dedup_min_subframe<P: PackedState>(nodes: &mut [P]) -> usize {
    if nodes.is_empty() {
        return 0;
    }
    let mut write = 0;
    for read in 1..nodes.len() {
        let node = nodes[read];
        debug_assert!(nodes[write] <= node, "dedup input is not sorted");
        if nodes[write] == node {
            if nodes[write].subframe() > node.subframe() {
                nodes[write].set_subframe(node.subframe());
            }
        } else {
            write += 1;
            nodes[write] = node;
        }
    }
    write + 1
}

/// Stream a merge heap into `out`, collapsing payload-equal records to
/// the smallest subframe. Output is sorted and payload-unique.
pub fn merge_into<P: PackedState, S: NodeSource<P>>(
    heap: &mut MergeHeap<P, S>,
    out: &mut NodeWriter<P>,
) -> Result<(), SiftError> {
    let mut current = match heap.head() {
        Some((node, _)) => node,
        None => return Ok(()),
    };
    while heap.next()? {
        let (node, _) = heap.head().expect("head after next");
        debug_assert!(current <= node);
        if current == node {
            if current.subframe() > node.subframe() {
                current.set_subframe(node.subframe());
            }
        } else {
            out.write_ordered(current)?;
            current = node;
        }
    }
    out.write_ordered(current)?;
    Ok(())
}

/// External sort of `open-g`: read RAM-sized chunks, sort and compact
/// each into `chunk-g-i`, then merge every chunk into `merged-g`.
/// A single chunk is renamed into place without a merge pass.
pub fn sort_and_merge<P: PackedState>(
    cfg: &SearchConfig,
    layout: &Layout,
    group: FrameGroup,
) -> Result<(), SiftError> {
    let chunk_records = cfg.sort_chunk_records::<P>();
    let mut chunks = 0usize;
    print!("Sorting... ");
    {
        let mut input = InputStream::<P>::open(&layout.group_file("open", group))?;
        let mut buffer: Vec<P> = vec![P::default(); chunk_records];
        loop {
            let records = input.read(&mut buffer)?;
            if records == 0 {
                break;
            }
            buffer[..records].sort_unstable();
            let kept = dedup_min_subframe(&mut buffer[..records]);
            let mut output = OutputStream::create(&layout.chunk_file(group, chunks))?;
            output.write(&buffer[..kept])?;
            output.flush()?;
            chunks += 1;
        }
    }

    print!("Merging... ");
    let merged = layout.group_file("merged", group);
    if chunks == 1 {
        files::rename(&layout.chunk_file(group, 0), &merged)?;
        return Ok(());
    }
    let merge_buffer = SearchConfig::records::<P>(cfg.merge_buffer_bytes);
    let mut readers: Vec<NodeReader<P>> = Vec::with_capacity(chunks);
    for i in 0..chunks {
        readers.push(NodeReader::open(&layout.chunk_file(group, i), merge_buffer)?.verify_order());
    }
    let merging = layout.group_file("merging", group);
    {
        let mut heap = MergeHeap::new(readers)?;
        let mut out = NodeWriter::create(&merging, SearchConfig::records::<P>(cfg.standard_buffer_bytes))?;
        merge_into(&mut heap, &mut out)?;
        out.flush()?;
    }
    files::rename(&merging, &merged)?;
    for i in 0..chunks {
        files::delete(&layout.chunk_file(group, i))?;
    }
    Ok(())
}

/// Subtract the union of `mask` from `source`, writing survivors to `out`
/// in order and handing each one to `on_kept`. All inputs must be sorted
/// and payload-unique.
pub fn filter_stream<P, Src, M, F>(
    source: &mut Src,
    mask: Option<&mut MergeHeap<P, M>>,
    out: &mut NodeWriter<P>,
    mut on_kept: F,
) -> Result<(), SiftError>
where
    P: PackedState,
    Src: NodeSource<P>,
    M: NodeSource<P>,
    F: FnMut(P) -> Result<(), SiftError>,
{
    let mut current = source.next_node()?;
    let heap = match mask {
        Some(heap) => heap,
        None => {
            while let Some(node) = current {
                out.write_ordered(node)?;
                on_kept(node)?;
                current = source.next_node()?;
            }
            return Ok(());
        }
    };

    while let Some(node) = current {
        if !heap.scan_to(&node)? {
            // Mask exhausted; everything left survives.
            let mut rest = Some(node);
            while let Some(n) = rest {
                out.write_ordered(n)?;
                on_kept(n)?;
                rest = source.next_node()?;
            }
            return Ok(());
        }
        let (head, _) = heap.head().expect("scan_to returned true");
        let mut cursor = Some(node);
        while let Some(n) = cursor {
            if n >= head {
                break;
            }
            out.write_ordered(n)?;
            on_kept(n)?;
            cursor = source.next_node()?;
        }
        while let Some(n) = cursor {
            if n != head {
                break;
            }
            cursor = source.next_node()?;
        }
        current = cursor;
    }
    Ok(())
}

/// Merge two sorted unique streams: the union goes to `out_union`, the
/// records only in `a` additionally go to `out_a_only` and `on_a_kept`.
pub fn merge_two_streams<P, A, B, F>(
    a: &mut A,
    b: &mut B,
    out_union: &mut NodeWriter<P>,
    out_a_only: &mut NodeWriter<P>,
    mut on_a_kept: F,
) -> Result<(), SiftError>
where
    P: PackedState,
    A: NodeSource<P>,
    B: NodeSource<P>,
    F: FnMut(P) -> Result<(), SiftError>,
{
    let mut head_a = a.next_node()?;
    let mut head_b = b.next_node()?;
    loop {
        match (head_a, head_b) {
            (None, None) => return Ok(()),
            (Some(node), None) => {
                out_union.write_ordered(node)?;
                out_a_only.write_ordered(node)?;
                on_a_kept(node)?;
                head_a = a.next_node()?;
            }
            (None, Some(node)) => {
                out_union.write_ordered(node)?;
                head_b = b.next_node()?;
            }
            (Some(na), Some(nb)) => {
                if na == nb {
                    out_union.write_ordered(na)?;
                    head_a = a.next_node()?;
                    head_b = b.next_node()?;
                } else if na < nb {
                    out_union.write_ordered(na)?;
                    out_a_only.write_ordered(na)?;
                    on_a_kept(na)?;
                    head_a = a.next_node()?;
                } else {
                    out_union.write_ordered(nb)?;
                    head_b = b.next_node()?;
                }
            }
        }
    }
}
