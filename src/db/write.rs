//! Write path: the writer queue, group commit, and the backpressure ladder.
//!
//! Concurrent writers enqueue tickets; the ticket at the head of the queue
//! becomes the leader and commits a combined batch for itself and the
//! waiters behind it, bounded so a tiny write is never held hostage by a
//! huge group. The group stays in the queue until its results are
//! published, which is what makes the head slot exclusive.
//!
//! A WAL failure poisons the store: the error is recorded and every write
//! from then on returns it untouched. Reads keep working.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::batch::Batch;
use crate::config::{L0_SLOWDOWN_TRIGGER, L0_STOP_TRIGGER, MAX_KEY_SIZE};
use crate::error::{Error, Result};
use crate::files;
use crate::key::MAX_SEQUENCE;
use crate::memtable::Memtable;
use crate::wal::LogWriter;

use super::Db;

/// Upper bound on a commit group.
const MAX_GROUP_BYTES: usize = 1 << 20;
/// When the leader batch is this small, the group is capped near it so
/// latency-sensitive small writes stay small.
const SMALL_BATCH_BYTES: usize = 128 * 1024;

pub(crate) struct WriteTicket {
    /// Taken by the leader when building the group.
    pub batch: Mutex<Option<Batch>>,
    pub sync: bool,
    /// Published by the leader; observed under the queue lock.
    pub result: Mutex<Option<Result<()>>>,
}

impl Db {
    pub fn put(&self, key: &[u8], value: &[u8], sync: bool) -> Result<()> {
        let mut batch = Batch::new();
        batch.put(key, value);
        self.write(batch, sync)
    }

    pub fn delete(&self, key: &[u8], sync: bool) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key);
        self.write(batch, sync)
    }

    /// Applies `batch` atomically. With `sync`, the WAL is fsync'd before
    /// the call returns.
    pub fn write(&self, batch: Batch, sync: bool) -> Result<()> {
        for (_, key, value) in batch.iter() {
            if key.len() > MAX_KEY_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "key of {} bytes exceeds the {MAX_KEY_SIZE} byte limit",
                    key.len()
                )));
            }
            if value.len() > u32::MAX as usize {
                return Err(Error::InvalidArgument("value exceeds 4GB".to_string()));
            }
        }
        self.write_internal(Some(batch), sync)
    }

    /// Queue entry point shared by `write` and the memtable-rotation path
    /// (`batch == None` forces a rotation without writing anything).
    pub(crate) fn write_internal(&self, batch: Option<Batch>, sync: bool) -> Result<()> {
        let force_rotate = batch.is_none();
        let ticket = Arc::new(WriteTicket {
            batch: Mutex::new(batch),
            sync,
            result: Mutex::new(None),
        });

        // Wait until this ticket is done (a leader committed it) or reaches
        // the head of the queue.
        {
            let mut queue = self.shared.write_queue.lock()?;
            queue.push_back(Arc::clone(&ticket));
            loop {
                if let Some(result) = ticket.result.lock()?.take() {
                    return result;
                }
                if queue
                    .front()
                    .map_or(false, |front| Arc::ptr_eq(front, &ticket))
                {
                    break;
                }
                queue = self.shared.write_done.wait(queue)?;
            }
        }

        // This thread is the leader. The group stays in the queue while it
        // commits, so the head slot is exclusive.
        let outcome = self.commit_as_leader(&ticket, force_rotate);

        let mut queue = self.shared.write_queue.lock()?;
        let mut own_result = None;
        // Publish to every committed ticket; they are at the queue front in
        // order.
        let committed = outcome.committed.max(1);
        for _ in 0..committed {
            let done = queue.pop_front().expect("committed tickets are queued");
            if Arc::ptr_eq(&done, &ticket) {
                own_result = Some(outcome.result.clone());
            } else {
                *done.result.lock()? = Some(outcome.result.clone());
            }
        }
        self.shared.write_done.notify_all();
        drop(queue);

        own_result.expect("leader ticket is part of its own group")
    }

    fn commit_as_leader(&self, ticket: &Arc<WriteTicket>, force_rotate: bool) -> CommitOutcome {
        match self.commit_group(ticket, force_rotate) {
            Ok(committed) => CommitOutcome {
                committed,
                result: Ok(()),
            },
            Err((committed, e)) => CommitOutcome {
                committed,
                result: Err(e),
            },
        }
    }

    /// Commits the leader's batch plus compatible waiters. Returns how many
    /// tickets took part; errors carry the same count so every participant
    /// hears the verdict.
    fn commit_group(
        &self,
        ticket: &Arc<WriteTicket>,
        force_rotate: bool,
    ) -> std::result::Result<usize, (usize, Error)> {
        let mem = self
            .make_room(force_rotate)
            .map_err(|e| (1usize, e))?;

        let (mut batch, group_size) = self.build_group(ticket).map_err(|e| (1usize, e))?;
        if batch.is_empty() {
            // Rotation-only or empty batches: nothing to journal.
            return Ok(group_size);
        }

        let base_sequence = {
            let versions = self.shared.versions.lock().map_err(|e| (group_size, e.into()))?;
            versions.last_sequence()
        };
        let count = batch.count() as u64;
        debug_assert!(base_sequence + count <= MAX_SEQUENCE);
        batch.set_sequence(base_sequence + 1);

        // WAL first. A failure here poisons the store: the record may be
        // half on disk, and nothing after it can be trusted.
        let written = {
            let mut wal = self.shared.wal.lock().map_err(|e| (group_size, e.into()))?;
            let writer = wal
                .as_mut()
                .ok_or_else(|| (group_size, Error::Io("store is closed".to_string())))?;
            writer
                .add_record(&batch.encode())
                .and_then(|()| if ticket.sync { writer.sync() } else { Ok(()) })
        };
        if let Err(e) = written {
            self.poison(&e);
            return Err((group_size, e));
        }

        // Memtable next; then publish the new sequence fence.
        for (offset, (kind, key, value)) in batch.iter().enumerate() {
            let sequence = base_sequence + 1 + offset as u64;
            if let Err(e) = mem.insert(sequence, kind, key, value) {
                // Only the write coordinator seals tables, and it does so
                // before handing out `mem`; getting here is a bug.
                self.poison(&e);
                return Err((group_size, e));
            }
        }
        {
            let mut versions = self.shared.versions.lock().map_err(|e| (group_size, e.into()))?;
            versions.set_last_sequence(base_sequence + count);
        }

        Ok(group_size)
    }

    /// Collects the leader's batch and compatible waiting batches into one.
    fn build_group(&self, leader: &Arc<WriteTicket>) -> Result<(Batch, usize)> {
        let queue = self.shared.write_queue.lock()?;
        debug_assert!(queue
            .front()
            .map_or(false, |front| Arc::ptr_eq(front, leader)));

        let mut combined = leader.batch.lock()?.take().unwrap_or_default();
        let mut group_size = 1;
        let leader_bytes = combined.approximate_size();
        let max_bytes = if leader_bytes <= SMALL_BATCH_BYTES {
            leader_bytes + SMALL_BATCH_BYTES
        } else {
            MAX_GROUP_BYTES
        };
        let mut total = leader_bytes;

        for follower in queue.iter().skip(1) {
            // A sync write must not be downgraded by riding a non-sync
            // group.
            if follower.sync && !leader.sync {
                break;
            }
            let mut follower_batch = follower.batch.lock()?;
            let bytes = match follower_batch.as_ref() {
                Some(batch) => batch.approximate_size(),
                // A rotation request; let it lead its own group.
                None => break,
            };
            if total + bytes > max_bytes {
                break;
            }
            combined.append(follower_batch.take().expect("checked above"));
            total += bytes;
            group_size += 1;
        }
        Ok((combined, group_size))
    }

    /// The backpressure ladder. Returns the memtable that accepts this
    /// write, sealing and rotating as needed.
    ///
    /// In order: an overfull level 0 first delays the write by one
    /// millisecond (once), then a full active table waits for the sealed
    /// one to flush, then a level 0 at the stop trigger blocks entirely;
    /// otherwise the active table is sealed and a fresh one installed.
    fn make_room(&self, force: bool) -> Result<Arc<Memtable>> {
        let mut allow_delay = !force;
        let mut force = force;
        loop {
            let mut state = self.shared.state.lock()?;
            if self.shared.shutting_down.load(Ordering::Acquire) {
                return Err(Error::Io("store is shutting down".to_string()));
            }
            if let Some(e) = &state.background_error {
                return Err(e.clone());
            }

            let l0_runs = {
                let versions = self.shared.versions.lock()?;
                versions.current().num_files(0)
            };

            if allow_delay && l0_runs >= L0_SLOWDOWN_TRIGGER {
                // Shed a little write throughput to the compactor instead
                // of stalling hard later. Applied at most once per write.
                allow_delay = false;
                drop(state);
                tracing::debug!(l0_runs, "level-0 slowdown, delaying write 1ms");
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            if !force && state.mem.approximate_size() <= self.shared.opts.write_buffer_size {
                return Ok(Arc::clone(&state.mem));
            }

            if state.imm.is_some() {
                tracing::debug!("waiting for sealed memtable flush");
                let _unused = self.shared.work_done.wait(state)?;
                continue;
            }

            if l0_runs >= L0_STOP_TRIGGER {
                tracing::warn!(l0_runs, "level-0 stop trigger reached, stalling write");
                let _unused = self.shared.work_done.wait(state)?;
                continue;
            }

            // Seal the active table, switch WAL files, start a fresh table.
            let new_log_no = {
                let mut versions = self.shared.versions.lock()?;
                versions.new_file_number()
            };
            let writer = match LogWriter::create(files::wal_path(&self.shared.dir, new_log_no)) {
                Ok(writer) => writer,
                Err(e) => {
                    let mut versions = self.shared.versions.lock()?;
                    versions.reuse_file_number(new_log_no);
                    return Err(e);
                }
            };
            *self.shared.wal.lock()? = Some(writer);
            state.log_no = new_log_no;
            state.mem.seal();
            state.imm = Some(Arc::clone(&state.mem));
            state.mem = Arc::new(Memtable::new());
            force = false;
            tracing::debug!(log_no = new_log_no, "sealed memtable, rotated log");
            self.shared.maybe_schedule_compaction(&mut state);
        }
    }

    fn poison(&self, e: &Error) {
        let mut state = self.shared.state.lock().unwrap();
        if state.background_error.is_none() {
            tracing::error!(error = %e, "write-ahead log failure, store is poisoned");
            state.background_error = Some(e.clone());
        }
    }
}

struct CommitOutcome {
    committed: usize,
    result: Result<()>,
}
