//! Gleaner reducer: sort-merges the records routed to one NUMA node and
//! emits snapshot pages.
//!
//! Entries are buffered in memory up to the configured budget; overflow
//! spills a sorted run file into the snapshot folder. Finalization k-way
//! merges the in-memory buffer with the spilled runs, deduplicates
//! overwrites of the same record (last committed write wins), and packs the
//! survivors into snapshot leaf pages.
use crate::error::Result;
use crate::log::record::LogKind;
use crate::snapshot::gleaner::{LogGleaner, ReducerOutput, SortEntry};
use crate::storage::array;
use crate::storage::page::Page;
use crate::storage::partition::PartitionId;
use crate::storage::{StorageId, StorageSpec};
use crate::xct::xct_id::XctId;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn run(
    gleaner: Arc<LogGleaner>,
    node: PartitionId,
    rx: flume::Receiver<Vec<SortEntry>>,
    result_tx: flume::Sender<ReducerOutput>,
) {
    scopeguard::defer! {
        gleaner.on_component_exit();
    }
    if !gleaner.ready_and_wait_for_start() {
        return;
    }
    match reduce(&gleaner, node, rx) {
        Ok(output) => {
            let _ = result_tx.send(output);
            gleaner.reducer_completed();
        }
        Err(e) => gleaner.report_error(format!("reducer {node}: {e}")),
    }
}

fn reduce(
    gleaner: &LogGleaner,
    node: PartitionId,
    rx: flume::Receiver<Vec<SortEntry>>,
) -> Result<ReducerOutput> {
    let budget = gleaner
        .engine()
        .config()
        .snapshot
        .reducer_buffer_size
        .as_u64() as usize;
    let mut buffer: Vec<SortEntry> = Vec::new();
    let mut buffered_bytes = 0usize;
    let mut runs: Vec<PathBuf> = Vec::new();

    loop {
        if gleaner.is_stop_requested() {
            cleanup_runs(&runs);
            return Ok(ReducerOutput { pages: Vec::new() });
        }
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(batch) => {
                for entry in batch {
                    buffered_bytes += entry.payload.len() + 64;
                    buffer.push(entry);
                }
                if buffered_bytes > budget {
                    let run = spill_run(gleaner, node, runs.len(), &mut buffer)?;
                    runs.push(run);
                    buffered_bytes = 0;
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            // all mappers completed and dropped their senders.
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    buffer.sort_by_key(|e| e.sort_key());
    let mut sources: Vec<MergeSource> = Vec::new();
    for run in &runs {
        sources.push(MergeSource::from_file(File::open(run)?)?);
    }
    sources.push(MergeSource::from_memory(std::mem::take(&mut buffer)));

    let output = emit_pages(gleaner, node, sources)?;
    cleanup_runs(&runs);
    tracing::debug!(node, runs = runs.len(), pages = output.pages.len(), "reducer done");
    Ok(output)
}

fn cleanup_runs(runs: &[PathBuf]) {
    for run in runs {
        let _ = std::fs::remove_file(run);
    }
}

/// Sorts the buffer and writes it out as one run file.
fn spill_run(
    gleaner: &LogGleaner,
    node: PartitionId,
    seq: usize,
    buffer: &mut Vec<SortEntry>,
) -> Result<PathBuf> {
    buffer.sort_by_key(|e| e.sort_key());
    let path = PathBuf::from(&gleaner.engine().config().snapshot.folder_path).join(format!(
        "reducer_{}_{}_run_{}.spill",
        gleaner.snapshot_id(),
        node,
        seq
    ));
    let mut writer = BufWriter::new(File::create(&path)?);
    for entry in buffer.drain(..) {
        writer.write_all(&entry.storage_id.to_le_bytes())?;
        writer.write_all(&[entry.kind as u8, 0, 0, 0])?;
        writer.write_all(&entry.key.to_le_bytes())?;
        writer.write_all(&entry.xct_id.word().to_le_bytes())?;
        writer.write_all(&(entry.payload.len() as u32).to_le_bytes())?;
        writer.write_all(&entry.payload)?;
    }
    writer.flush()?;
    tracing::debug!(node, seq, "reducer spilled a sorted run");
    Ok(path)
}

/// One sorted input of the final merge: the in-memory buffer or a run file.
enum MergeSourceKind {
    Memory(std::vec::IntoIter<SortEntry>),
    File(BufReader<File>),
}

struct MergeSource {
    next: Option<SortEntry>,
    kind: MergeSourceKind,
}

impl MergeSource {
    fn from_memory(entries: Vec<SortEntry>) -> MergeSource {
        let mut source = MergeSource {
            next: None,
            kind: MergeSourceKind::Memory(entries.into_iter()),
        };
        source.advance();
        source
    }

    fn from_file(file: File) -> Result<MergeSource> {
        let mut source = MergeSource {
            next: None,
            kind: MergeSourceKind::File(BufReader::new(file)),
        };
        source.advance();
        Ok(source)
    }

    fn advance(&mut self) {
        self.next = match &mut self.kind {
            MergeSourceKind::Memory(iter) => iter.next(),
            MergeSourceKind::File(reader) => read_spilled_entry(reader),
        };
    }
}

fn read_spilled_entry(reader: &mut BufReader<File>) -> Option<SortEntry> {
    let mut header = [0u8; 28];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(_) => return None, // end of run
    }
    let storage_id = u32::from_le_bytes(header[0..4].try_into().unwrap());
    let kind = LogKind::from_u8(header[4])?;
    let key = u64::from_le_bytes(header[8..16].try_into().unwrap());
    let xct_id = XctId::from_word(u64::from_le_bytes(header[16..24].try_into().unwrap()));
    let len = u32::from_le_bytes(header[24..28].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).ok()?;
    Some(SortEntry {
        storage_id,
        kind,
        key,
        xct_id,
        payload,
    })
}

/// Pops the globally-smallest entry across sources. Source count is tiny
/// (runs + 1), so a linear scan beats a heap here.
fn pop_min(sources: &mut [MergeSource]) -> Option<SortEntry> {
    let mut min_idx: Option<usize> = None;
    for (idx, source) in sources.iter().enumerate() {
        if let Some(entry) = &source.next {
            let better = match min_idx {
                None => true,
                Some(m) => entry.sort_key() < sources[m].next.as_ref().unwrap().sort_key(),
            };
            if better {
                min_idx = Some(idx);
            }
        }
    }
    let idx = min_idx?;
    let entry = sources[idx].next.take();
    sources[idx].advance();
    entry
}

/// Streams the merged, deduplicated entries into snapshot pages.
fn emit_pages(
    gleaner: &LogGleaner,
    node: PartitionId,
    mut sources: Vec<MergeSource>,
) -> Result<ReducerOutput> {
    let engine = gleaner.engine();
    let store = engine.snapshot_manager().page_store(node as u16);
    let snapshot_id = gleaner.snapshot_id();
    let mut pages: Vec<(StorageId, usize, crate::storage::page::SnapshotPagePointer)> = Vec::new();

    // current array leaf being filled
    let mut leaf: Option<(StorageId, u64, Box<Page>)> = None;
    // current sequential page: (storage, child index, write cursor, page)
    let mut seq: Option<(StorageId, usize, usize, Box<Page>)> = None;

    let flush_leaf =
        |leaf: &mut Option<(StorageId, u64, Box<Page>)>,
         pages: &mut Vec<(StorageId, usize, crate::storage::page::SnapshotPagePointer)>| {
            if let Some((storage_id, leaf_idx, page)) = leaf.take() {
                let ptr = store.append(page, snapshot_id);
                pages.push((storage_id, leaf_idx as usize, ptr));
            }
        };
    let flush_seq =
        |seq: &mut Option<(StorageId, usize, usize, Box<Page>)>,
         pages: &mut Vec<(StorageId, usize, crate::storage::page::SnapshotPagePointer)>| {
            if let Some((storage_id, child, _, page)) = seq.take() {
                let ptr = store.append(page, snapshot_id);
                pages.push((storage_id, child, ptr));
            }
        };

    let mut pending: Option<SortEntry> = None;
    loop {
        let next = pop_min(&mut sources);
        // dedup: consecutive overwrites of one record keep only the last
        // (largest xct_id), which pop_min yields last.
        if let (Some(p), Some(n)) = (&pending, &next) {
            if p.kind == LogKind::ArrayOverwrite
                && n.kind == LogKind::ArrayOverwrite
                && p.storage_id == n.storage_id
                && p.key == n.key
            {
                pending = next;
                continue;
            }
        }
        let entry = match std::mem::replace(&mut pending, next) {
            Some(entry) => entry,
            None => match pending.is_some() {
                true => continue,
                false => break,
            },
        };

        match entry.kind {
            LogKind::ArrayOverwrite => {
                let cb = match engine.storage_manager().get_storage(entry.storage_id) {
                    Ok(cb) => cb,
                    Err(_) => continue, // dropped while gleaning
                };
                let payload_size = match cb.meta.spec {
                    StorageSpec::Array { payload_size, .. } => payload_size,
                    _ => continue,
                };
                let rs = array::record_size(payload_size);
                let capacity = array::leaf_capacity(payload_size) as u64;
                let leaf_idx = entry.key / capacity;
                let matches = matches!(&leaf, Some((sid, li, _)) if *sid == entry.storage_id && *li == leaf_idx);
                if !matches {
                    flush_leaf(&mut leaf, &mut pages);
                    // TODO: compose with the previous snapshot's leaf when
                    // only part of a leaf was rewritten in this window.
                    let mut page = Page::new_boxed_zeroed();
                    page.init_header(entry.storage_id, leaf_idx + 1);
                    leaf = Some((entry.storage_id, leaf_idx, page));
                }
                let (_, _, page) = leaf.as_mut().unwrap();
                let index = (entry.key % capacity) as usize;
                let data = &entry.payload[8..8 + payload_size as usize];
                // SAFETY: the page is exclusively owned until appended.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        page.leaf_record_payload(index, rs),
                        payload_size as usize,
                    );
                }
                page.leaf_record_owner(index, rs)
                    .set_xct_id(entry.xct_id.clear_status_bits());
            }
            LogKind::SequentialAppend => {
                let needed = 4 + entry.payload.len();
                let fits = matches!(&seq, Some((sid, _, cursor, _))
                    if *sid == entry.storage_id
                        && *cursor + needed <= crate::storage::page::PAGE_PAYLOAD_SIZE);
                if !fits {
                    let next_child = match &seq {
                        Some((sid, child, _, _)) if *sid == entry.storage_id => child + 1,
                        _ => 0,
                    };
                    flush_seq(&mut seq, &mut pages);
                    let mut page = Page::new_boxed_zeroed();
                    page.init_header(entry.storage_id, next_child as u64 + 1);
                    seq = Some((entry.storage_id, next_child, 0, page));
                }
                let (_, _, cursor, page) = seq.as_mut().unwrap();
                // SAFETY: cursor stays within the payload area by the check
                // above; the page is exclusively owned.
                unsafe {
                    let base = page.payload_ptr().add(*cursor);
                    std::ptr::copy_nonoverlapping(
                        (entry.payload.len() as u32).to_le_bytes().as_ptr(),
                        base,
                        4,
                    );
                    std::ptr::copy_nonoverlapping(
                        entry.payload.as_ptr(),
                        base.add(4),
                        entry.payload.len(),
                    );
                }
                *cursor += needed;
            }
            _ => {}
        }
    }
    flush_leaf(&mut leaf, &mut pages);
    flush_seq(&mut seq, &mut pages);
    Ok(ReducerOutput { pages })
}
