use crate::crypto::keyset::KeySet;
use crate::crypto::{ctr_counter, AesKey};
use crate::formats::nca::{self, DistributionType, NcaHeader, NCA_HEADER_SIZE};
use crate::formats::ncz::{
    self, NczBlockHeader, NczBlockInfo, NczSection, BLOCK_HEADER_SIZE, SECTION_SIZE,
};
use crate::formats::ticket::Ticket;
use crate::hexstring::HexData;
use crate::ids::{ContentId, PlaceholderId, RightsId};
use crate::install::config::Config;
use crate::install::error::{
    Error, InvalidNczSectionCountSnafu, NcaSnafu, NczSnafu, Result, SourceSnafu, StoreSnafu,
    TicketNotFoundSnafu, TicketSnafu,
};
use crate::install::progress::ProgressSink;
use crate::install::ring::{Chunk, RingBuf};
use crate::install::{NcaInstall, TicketRecord};
use crate::ncm::ContentStorage;
use crate::source::{ByteSource, ByteSourceExt, SourceError};
use aes::Aes128;
use binrw::BinRead;
use cipher::StreamCipher;
use ctr::Ctr128BE;
use sha2::{Digest, Sha256};
use snafu::{ensure, ResultExt};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) const INFLATE_BUFFER_MAX: usize = 4 * 1024 * 1024;
const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;
// keeps peak memory down when the backing store is a hosted filesystem
const READ_BUFFER_SIZE_THROTTLED: usize = 512 * 1024;

/// The first read covers the NCA header area plus the section-table probe.
const FIRST_READ_SIZE: u64 = ncz::SECTION_TABLE_OFFSET + ncz::SECTION_HEADER_SIZE as u64;

const READ: usize = 0;
const DECOMPRESS: usize = 1;
const WRITE: usize = 2;

pub(crate) struct PipelineContext<'a> {
    pub keys: &'a KeySet,
    pub config: &'a Config,
    pub source: &'a dyn ByteSource,
    pub storage: &'a dyn ContentStorage,
    pub sink: &'a dyn ProgressSink,
}

#[derive(Clone)]
struct NczState {
    sections: Vec<NczSection>,
    block_header: Option<NczBlockHeader>,
    blocks: Vec<NczBlockInfo>,
}

struct Shared<'a> {
    cx: &'a PipelineContext<'a>,
    tickets: &'a Mutex<Vec<TicketRecord>>,

    entry_offset: u64,
    entry_size: i64,
    placeholder_id: PlaceholderId,

    read_ring: Mutex<RingBuf<4>>,
    can_read: Condvar,
    can_decompress: Condvar,
    write_ring: Mutex<RingBuf<4>>,
    can_decompress_write: Condvar,
    can_write: Condvar,

    ncz: Mutex<Option<NczState>>,
    header_out: Mutex<Option<NcaHeader>>,
    hash_out: Mutex<Option<[u8; 0x20]>>,
    modified: AtomicBool,

    read_offset: AtomicI64,
    decompress_offset: AtomicI64,
    write_offset: AtomicI64,
    write_size: AtomicI64,

    running: [AtomicBool; 3],
    results: [Mutex<Option<Result<()>>>; 3],
    failed: AtomicBool,

    progress: SyncSender<()>,
    read_buffer_size: usize,
}

impl<'a> Shared<'a> {
    /// Fast liveness check the workers run between steps.
    fn check(&self) -> Result<()> {
        if self.cx.sink.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::CancelledByPeer);
        }
        Ok(())
    }

    fn any_running(&self) -> bool {
        self.running.iter().any(|r| r.load(Ordering::Acquire))
    }

    fn wake_all(&self) {
        self.can_read.notify_all();
        self.can_decompress.notify_all();
        self.can_decompress_write.notify_all();
        self.can_write.notify_all();
    }

    fn finish_stage(&self, stage: usize, result: Result<()>) {
        if result.is_err() {
            self.failed.store(true, Ordering::Release);
        }
        *self.results[stage].lock().expect("BUG: result mutex poisoned") = Some(result);
        self.running[stage].store(false, Ordering::Release);

        // peers may be waiting on data that never comes
        self.wake_all();
        let _ = self.progress.try_send(());
    }

    /// Maps the per-stage results to the install outcome: cancellation
    /// first, then the earliest stage's own error.
    fn take_results(&self) -> Result<()> {
        let mut cancelled = self.cx.sink.is_cancelled();
        let mut first = None;
        for slot in &self.results {
            let result = slot.lock().expect("BUG: result mutex poisoned").take();
            match result {
                Some(Err(Error::Cancelled)) => cancelled = true,
                Some(Err(Error::CancelledByPeer)) | Some(Ok(())) | None => {}
                Some(Err(e)) => {
                    if first.is_none() {
                        first = Some(e);
                    }
                }
            }
        }
        if cancelled {
            return Err(Error::Cancelled);
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn lock_ring<'r, const N: usize>(
        ring: &'r Mutex<RingBuf<N>>,
    ) -> MutexGuard<'r, RingBuf<N>> {
        ring.lock().expect("BUG: ring mutex poisoned")
    }

    /// Read → decompress ring. Dropped on the floor if the consumer is
    /// gone, like a closed pipe.
    fn push_decompress(&self, chunk: Chunk) -> Result<()> {
        let mut ring = Self::lock_ring(&self.read_ring);
        while ring.is_full() {
            if !self.running[DECOMPRESS].load(Ordering::Acquire) {
                return Ok(());
            }
            self.check()?;
            ring = self
                .can_read
                .wait(ring)
                .expect("BUG: ring mutex poisoned");
        }
        self.check()?;
        ring.push(chunk);
        self.can_decompress.notify_one();
        Ok(())
    }

    /// `None` means the producer exited and the ring drained: end of input.
    fn pop_decompress(&self) -> Result<Option<Chunk>> {
        let mut ring = Self::lock_ring(&self.read_ring);
        while ring.is_empty() {
            if !self.running[READ].load(Ordering::Acquire) {
                return Ok(None);
            }
            self.check()?;
            ring = self
                .can_decompress
                .wait(ring)
                .expect("BUG: ring mutex poisoned");
        }
        self.check()?;
        let chunk = ring.pop();
        self.can_read.notify_one();
        Ok(Some(chunk))
    }

    fn push_write(&self, chunk: Chunk) -> Result<()> {
        let mut ring = Self::lock_ring(&self.write_ring);
        while ring.is_full() {
            if !self.running[WRITE].load(Ordering::Acquire) {
                return Ok(());
            }
            self.check()?;
            ring = self
                .can_decompress_write
                .wait(ring)
                .expect("BUG: ring mutex poisoned");
        }
        self.check()?;
        ring.push(chunk);
        self.can_write.notify_one();
        Ok(())
    }

    fn pop_write(&self) -> Result<Option<Chunk>> {
        let mut ring = Self::lock_ring(&self.write_ring);
        while ring.is_empty() {
            if !self.running[DECOMPRESS].load(Ordering::Acquire) {
                return Ok(None);
            }
            self.check()?;
            ring = self
                .can_write
                .wait(ring)
                .expect("BUG: ring mutex poisoned");
        }
        self.check()?;
        let chunk = ring.pop();
        self.can_decompress_write.notify_one();
        Ok(Some(chunk))
    }

    /// Sequential source read for the read stage; clamped to the entry and
    /// intolerant of short reads.
    fn read_source(&self, buf: &mut [u8]) -> Result<()> {
        let offset = self.read_offset.load(Ordering::Acquire);
        let remaining = self.entry_size - offset;
        if (buf.len() as i64) > remaining {
            return Err(Error::Source {
                source: SourceError::ShortRead {
                    offset: self.entry_offset + offset as u64,
                    wanted: buf.len(),
                    got: remaining.max(0) as usize,
                },
            });
        }

        self.cx
            .source
            .read_exact_at(self.entry_offset + offset as u64, buf)
            .context(SourceSnafu)?;
        self.read_offset
            .fetch_add(buf.len() as i64, Ordering::AcqRel);
        Ok(())
    }
}

/// Marks the matching ticket required by `header` (if any) and returns its
/// index. A valid rights id without a ticket in the container is fatal.
fn note_ticket_requirement(
    header: &NcaHeader,
    tickets: &Mutex<Vec<TicketRecord>>,
) -> Result<Option<usize>> {
    if !header.has_rights_id() {
        return Ok(None);
    }

    let mut tickets = tickets.lock().expect("BUG: tickets mutex poisoned");
    let found = tickets
        .iter_mut()
        .enumerate()
        .find(|(_, t)| t.rights_id == header.rights_id);

    match found {
        Some((index, ticket)) => {
            ticket.required = true;
            ticket.key_generation = header.key_generation();
            Ok(Some(index))
        }
        None => TicketNotFoundSnafu {
            rights_id: header.rights_id,
        }
        .fail(),
    }
}

// read stage: pulls raw source bytes, consumes the NCZ tables when present
fn read_worker(shared: &Shared) -> Result<()> {
    let mut carry: Vec<u8> = Vec::new();
    let mut probed = false;

    while shared.read_offset.load(Ordering::Acquire) < shared.entry_size {
        shared.check()?;

        let offset = shared.read_offset.load(Ordering::Acquire);
        let chunk_offset = offset - carry.len() as i64;

        let target = if offset == 0 {
            FIRST_READ_SIZE as usize
        } else {
            shared.read_buffer_size
        };

        let mut buf = std::mem::take(&mut carry);
        let head = buf.len();
        let want = std::cmp::min(
            target.saturating_sub(head) as i64,
            shared.entry_size - offset,
        ) as usize;

        buf.resize(head + want, 0);
        shared.read_source(&mut buf[head..])?;
        if buf.is_empty() {
            break;
        }

        // probe for the NCZ section table exactly once, the first time the
        // cursor clears the header area
        if !probed
            && chunk_offset == 0
            && shared.read_offset.load(Ordering::Acquire) >= FIRST_READ_SIZE as i64
        {
            probed = true;
            let probe = &buf[ncz::SECTION_TABLE_OFFSET as usize..];
            if probe[..8] == *ncz::SECTION_MAGIC {
                let section_count = u64::from_le_bytes(probe[8..0x10].try_into().unwrap());
                ensure!(section_count != 0, InvalidNczSectionCountSnafu);
                info!("found ncz, total number of sections: {section_count}");

                buf.truncate(ncz::SECTION_TABLE_OFFSET as usize);

                let mut table = vec![0u8; section_count as usize * SECTION_SIZE];
                shared.read_source(&mut table)?;
                let mut cursor = Cursor::new(&table);
                let sections = (0..section_count)
                    .map(|_| {
                        NczSection::read(&mut cursor)
                            .map_err(|source| ncz::NczError::Parsing { source })
                            .context(NczSnafu)
                    })
                    .collect::<Result<Vec<_>>>()?;

                // a block table may follow; stream sources cannot seek back,
                // so a failed probe is carried into the next chunk instead
                let mut block_probe = [0u8; BLOCK_HEADER_SIZE];
                shared.read_source(&mut block_probe)?;

                let mut state = NczState {
                    sections,
                    block_header: None,
                    blocks: Vec::new(),
                };

                if block_probe[..8] == *ncz::BLOCK_MAGIC {
                    let block_header = NczBlockHeader::read(&mut Cursor::new(&block_probe))
                        .map_err(|source| ncz::NczError::Parsing { source })
                        .context(NczSnafu)?;
                    block_header.validate().context(NczSnafu)?;

                    let mut sizes = vec![0u8; block_header.number_of_blocks as usize * 4];
                    shared.read_source(&mut sizes)?;

                    let mut block_offset = shared.read_offset.load(Ordering::Acquire);
                    let blocks = sizes
                        .chunks_exact(4)
                        .map(|raw| {
                            let size = u32::from_le_bytes(raw.try_into().unwrap()) as i64;
                            let info = NczBlockInfo {
                                offset: block_offset,
                                size,
                            };
                            block_offset += size;
                            info
                        })
                        .collect();

                    debug!("ncz block table: {} blocks", block_header.number_of_blocks);
                    state.block_header = Some(block_header);
                    state.blocks = blocks;
                } else {
                    debug!("no ncz block table, carrying {} probe bytes", BLOCK_HEADER_SIZE);
                    carry = block_probe.to_vec();
                }

                *shared.ncz.lock().expect("BUG: ncz mutex poisoned") = Some(state);
            }
        }

        shared.push_decompress(Chunk {
            buf,
            offset: chunk_offset,
        })?;
    }

    // a failed block probe with nothing after it still has to reach the
    // next stage
    if !carry.is_empty() {
        let offset = shared.read_offset.load(Ordering::Acquire) - carry.len() as i64;
        shared.push_decompress(Chunk { buf: carry, offset })?;
    }

    debug!("read stage done");
    Ok(())
}

fn update_hash(shared: &Shared, hasher: &mut Sha256, data: &[u8]) {
    if !shared.cx.config.skip_nca_hash_verify {
        hasher.update(data);
    }
}

/// Decrypts, verifies and (maybe) rewrites the NCA header sitting at the
/// start of `chunk_buf`, leaving it re-encrypted in place when modified.
fn process_header(shared: &Shared, chunk_buf: &mut [u8]) -> Result<()> {
    let cx = shared.cx;
    if chunk_buf.len() < NCA_HEADER_SIZE {
        return Err(Error::Nca {
            source: nca::NcaError::Truncated {
                expected: NCA_HEADER_SIZE,
                actual: chunk_buf.len(),
            },
        });
    }

    let header_bytes: [u8; NCA_HEADER_SIZE] = chunk_buf[..NCA_HEADER_SIZE].try_into().unwrap();
    let (original, plain) = nca::decrypt_header(cx.keys, &header_bytes).context(NcaSnafu)?;
    debug!("nca header ok, content type {:?}", original.content_type);

    if !cx.config.skip_rsa_header_fixed_key_verify {
        nca::verify_fixed_key(cx.keys, &original, &plain).context(NcaSnafu)?;
    }

    *shared
        .header_out
        .lock()
        .expect("BUG: header mutex poisoned") = Some(original);

    // the collection entry size lies for NCZ, the header knows the truth
    let write_size = original.nca_size as i64;
    shared.write_size.store(write_size, Ordering::Release);
    cx.storage
        .set_placeholder_size(shared.placeholder_id, write_size as u64)
        .context(StoreSnafu)?;

    let mut header = original;
    let mut modified = false;

    if !cx.config.ignore_distribution_bit
        && header.distribution_type == DistributionType::GameCard
    {
        header.distribution_type = DistributionType::Download;
        modified = true;
    }

    let ticket_index = note_ticket_requirement(&header, shared.tickets)?;

    let mut keak_generation = None;
    if cx.config.convert_to_standard_crypto && ticket_index.is_some() {
        let index = ticket_index.unwrap();
        let key_generation = header.key_generation();

        let ticket_bytes = {
            let tickets = shared.tickets.lock().expect("BUG: tickets mutex poisoned");
            tickets[index].ticket.clone()
        };
        let ticket = Ticket::parse(&ticket_bytes).context(TicketSnafu)?;
        let title_key = ticket
            .title_key_decrypted(cx.keys, key_generation)
            .context(TicketSnafu)?;
        info!("converting to standard crypto at generation {key_generation}");

        header.key_area.keys = [HexData([0; 0x10]); 4];
        header.key_area.keys[nca::KEY_AREA_CTR_SLOT] = title_key.0;
        header.rights_id = RightsId::default();

        let mut tickets = shared.tickets.lock().expect("BUG: tickets mutex poisoned");
        tickets[index].required = false;

        keak_generation = Some(key_generation);
    } else if cx.config.lower_master_key {
        nca::decrypt_key_area(cx.keys, &mut header).context(NcaSnafu)?;
        keak_generation = Some(0);
    }

    if let Some(generation) = keak_generation {
        nca::encrypt_key_area(cx.keys, &mut header, generation).context(NcaSnafu)?;
        modified = true;
    }

    if modified {
        let ciphertext = nca::encrypt_header(cx.keys, &header).context(NcaSnafu)?;
        chunk_buf[..NCA_HEADER_SIZE].copy_from_slice(&ciphertext);
        shared.modified.store(true, Ordering::Release);
    }

    Ok(())
}

struct NczExpand {
    sections: Vec<NczSection>,
    section: Option<NczSection>,
    cipher: Option<Ctr128BE<Aes128>>,
    inflate_buf: Vec<u8>,
    inflate_len: usize,
}

impl NczExpand {
    fn new(sections: Vec<NczSection>) -> Self {
        Self {
            sections,
            section: None,
            cipher: None,
            inflate_buf: Vec::with_capacity(INFLATE_BUFFER_MAX),
            inflate_len: 0,
        }
    }

    /// Re-encrypts `inflate_buf[..size]` section by section and hands it to
    /// the write stage; any tail beyond `size` is kept for the next round.
    fn flush(
        &mut self,
        shared: &Shared,
        hasher: &mut Sha256,
        written: &mut i64,
        size: usize,
    ) -> Result<()> {
        if self.inflate_len == 0 {
            return Ok(());
        }

        let tail = self.inflate_buf[size..self.inflate_len].to_vec();
        let mut out = std::mem::take(&mut self.inflate_buf);
        out.truncate(size);

        let mut off = 0usize;
        while off < size {
            let in_section = self
                .section
                .as_ref()
                .is_some_and(|s| s.in_range(*written));
            if !in_section {
                let section = self
                    .sections
                    .iter()
                    .find(|s| s.in_range(*written))
                    .cloned()
                    .ok_or(Error::NczSectionNotFound { offset: *written })?;
                debug!("ncz section at {:#x}, crypto {}", section.offset, section.crypto_type);

                self.cipher = if section.is_encrypted() {
                    let nonce: [u8; 8] = section.crypto_counter.0[..8].try_into().unwrap();
                    let key = AesKey(section.crypto_key);
                    Some(key.ctr_cipher(&ctr_counter(&nonce, *written as u64)))
                } else {
                    None
                };
                self.section = Some(section);
            }

            let section = self.section.as_ref().unwrap();
            let step = std::cmp::min(section.end() as i64 - *written, (size - off) as i64) as usize;

            if let Some(cipher) = &mut self.cipher {
                cipher.apply_keystream(&mut out[off..off + step]);
            }

            *written += step as i64;
            off += step;
        }

        update_hash(shared, hasher, &out);
        shared.push_write(Chunk {
            buf: out,
            offset: 0,
        })?;

        self.inflate_len = tail.len();
        self.inflate_buf = tail;
        Ok(())
    }
}

// decompress stage: header decrypt/rewrite, NCZ expansion and the running
// content hash
fn decompress_worker(shared: &Shared) -> Result<()> {
    use zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};

    let mut zctx = Decoder::new().map_err(|e| Error::NczZstd {
        message: e.to_string(),
    })?;
    let out_chunk = zstd::zstd_safe::DCtx::out_size();

    let mut hasher = Sha256::new();
    let mut is_ncz = false;
    let mut ncz_state: Option<NczState> = None;
    let mut expand: Option<NczExpand> = None;
    let mut block: Option<(NczBlockInfo, bool)> = None;
    let mut block_offset: i64 = 0;
    let mut written: i64 = 0;

    while shared.decompress_offset.load(Ordering::Acquire)
        < shared.write_size.load(Ordering::Acquire)
    {
        let Some(mut chunk) = shared.pop_decompress()? else {
            break;
        };
        if chunk.buf.is_empty() {
            break;
        }

        if !is_ncz {
            if let Some(state) = shared.ncz.lock().expect("BUG: ncz mutex poisoned").as_ref() {
                is_ncz = true;
                expand = Some(NczExpand::new(state.sections.clone()));
                ncz_state = Some(state.clone());
            }
        }

        if !is_ncz || chunk.offset == 0 {
            if chunk.offset == 0 {
                process_header(shared, &mut chunk.buf)?;
            }

            written += chunk.buf.len() as i64;
            shared
                .decompress_offset
                .fetch_add(chunk.buf.len() as i64, Ordering::AcqRel);
            update_hash(shared, &mut hasher, &chunk.buf);
            shared.push_write(chunk)?;
            continue;
        }

        let state = ncz_state.as_ref().unwrap();
        let expand = expand.as_mut().unwrap();

        let mut buf_off = 0usize;
        let mut source_offset = chunk.offset;
        while buf_off < chunk.buf.len() {
            let mut slice_len = chunk.buf.len() - buf_off;
            let mut compressed = true;

            if !state.blocks.is_empty() {
                let in_block = block.is_some_and(|(b, _)| b.in_range(source_offset));
                if !in_block {
                    block_offset = 0;
                    let index = state
                        .blocks
                        .iter()
                        .position(|b| b.in_range(source_offset))
                        .ok_or(Error::NczBlockNotFound {
                            offset: source_offset,
                        })?;
                    block = Some((
                        state.blocks[index],
                        index == state.blocks.len() - 1,
                    ));
                }

                let (current, is_last) = block.unwrap();
                let block_header = state.block_header.as_ref().unwrap();
                let mut expected_decompressed = 1i64 << block_header.block_size_exponent;
                if is_last {
                    // the trailing block may decompress to a remainder
                    let remainder =
                        block_header.total_decompressed_size as i64 % expected_decompressed;
                    if remainder != 0 {
                        expected_decompressed = remainder;
                    }
                }

                // a block is stored iff its compressed size equals the
                // decompressed size it is expected to produce
                compressed = current.size != expected_decompressed;

                // blocks can be up to 32 GiB, clip to the current one
                slice_len =
                    std::cmp::min(slice_len as i64, current.size - block_offset) as usize;
            }

            let slice = &chunk.buf[buf_off..buf_off + slice_len];

            if compressed {
                let mut input = InBuffer::around(slice);
                while input.pos < input.src.len() {
                    shared.check()?;

                    expand.inflate_buf.resize(expand.inflate_len + out_chunk, 0);
                    let produced = {
                        let mut output =
                            OutBuffer::around(&mut expand.inflate_buf[expand.inflate_len..]);
                        zctx.run(&mut input, &mut output).map_err(|e| Error::NczZstd {
                            message: e.to_string(),
                        })?;
                        output.pos()
                    };
                    expand.inflate_len += produced;
                    expand.inflate_buf.truncate(expand.inflate_len);

                    shared
                        .decompress_offset
                        .fetch_add(produced as i64, Ordering::AcqRel);
                    if expand.inflate_len >= INFLATE_BUFFER_MAX {
                        expand.flush(shared, &mut hasher, &mut written, INFLATE_BUFFER_MAX)?;
                    }
                }
            } else {
                expand.inflate_buf.truncate(expand.inflate_len);
                expand.inflate_buf.extend_from_slice(slice);
                expand.inflate_len += slice.len();

                shared
                    .decompress_offset
                    .fetch_add(slice.len() as i64, Ordering::AcqRel);
                if expand.inflate_len >= INFLATE_BUFFER_MAX {
                    expand.flush(shared, &mut hasher, &mut written, INFLATE_BUFFER_MAX)?;
                }
            }

            buf_off += slice_len;
            source_offset += slice_len as i64;
            block_offset += slice_len as i64;
        }
    }

    // flush whatever is left of the expansion buffer
    if let Some(expand) = expand.as_mut() {
        if expand.inflate_len > 0 {
            let size = expand.inflate_len;
            expand.flush(shared, &mut hasher, &mut written, size)?;
        }
    }

    *shared.hash_out.lock().expect("BUG: hash mutex poisoned") =
        Some(hasher.finalize().into());

    debug!("decompress stage done");
    Ok(())
}

// write stage: appends to the placeholder at monotonic offsets
fn write_worker(shared: &Shared) -> Result<()> {
    let throttled = shared.cx.config.file_based_emummc;

    while shared.write_offset.load(Ordering::Acquire) < shared.write_size.load(Ordering::Acquire)
    {
        let Some(chunk) = shared.pop_write()? else {
            break;
        };
        if chunk.buf.is_empty() {
            break;
        }

        let mut off = 0usize;
        while off < chunk.buf.len()
            && shared.write_offset.load(Ordering::Acquire)
                < shared.write_size.load(Ordering::Acquire)
        {
            shared.check()?;

            let write_size = std::cmp::min(shared.read_buffer_size, chunk.buf.len() - off);
            let write_offset = shared.write_offset.load(Ordering::Acquire);
            shared
                .cx
                .storage
                .write_placeholder(
                    shared.placeholder_id,
                    write_offset as u64,
                    &chunk.buf[off..off + write_size],
                )
                .context(StoreSnafu)?;

            off += write_size;
            shared
                .write_offset
                .fetch_add(write_size as i64, Ordering::AcqRel);
            let _ = shared.progress.try_send(());

            if throttled {
                // give the host filesystem some headroom
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    debug!("write stage done");
    Ok(())
}

/// Runs the three-stage pipeline for one content, or takes the
/// skip-if-installed shortcut. On success `nca` carries the produced hash,
/// final content id and (possibly) the parsed header.
pub(crate) fn install_content(
    cx: &PipelineContext<'_>,
    tickets: &Mutex<Vec<TicketRecord>>,
    nca: &mut NcaInstall,
) -> Result<()> {
    let config = cx.config;

    // consult the store before allocating anything
    if config.skip_if_already_installed || config.ticket_only {
        if cx.storage.has(nca.declared_id).context(StoreSnafu)? {
            debug!("{} already installed, skipping", nca.entry.name);
            nca.skipped = true;

            let mut buf = [0u8; NCA_HEADER_SIZE];
            let read = cx
                .storage
                .read_content(nca.declared_id, 0, &mut buf)
                .context(StoreSnafu)?;
            if read != NCA_HEADER_SIZE {
                return Err(Error::Nca {
                    source: nca::NcaError::Truncated {
                        expected: NCA_HEADER_SIZE,
                        actual: read,
                    },
                });
            }

            let (header, _) = nca::decrypt_header(cx.keys, &buf).context(NcaSnafu)?;
            note_ticket_requirement(&header, tickets)?;
            nca.header = Some(header);
            return Ok(());
        }
    }

    let placeholder_id = cx.storage.generate_placeholder_id().context(StoreSnafu)?;
    cx.storage
        .create_placeholder(nca.declared_id, placeholder_id, nca.entry.size)
        .context(StoreSnafu)?;
    nca.placeholder_id = Some(placeholder_id);

    let (progress_tx, progress_rx) = sync_channel(1);
    let shared = Shared {
        cx,
        tickets,
        entry_offset: nca.entry.offset,
        entry_size: nca.entry.size as i64,
        placeholder_id,
        read_ring: Mutex::new(RingBuf::new()),
        can_read: Condvar::new(),
        can_decompress: Condvar::new(),
        write_ring: Mutex::new(RingBuf::new()),
        can_decompress_write: Condvar::new(),
        can_write: Condvar::new(),
        ncz: Mutex::new(None),
        header_out: Mutex::new(None),
        hash_out: Mutex::new(None),
        modified: AtomicBool::new(false),
        read_offset: AtomicI64::new(0),
        decompress_offset: AtomicI64::new(0),
        write_offset: AtomicI64::new(0),
        write_size: AtomicI64::new(nca.entry.size as i64),
        running: [
            AtomicBool::new(true),
            AtomicBool::new(true),
            AtomicBool::new(true),
        ],
        results: [Mutex::new(None), Mutex::new(None), Mutex::new(None)],
        failed: AtomicBool::new(false),
        progress: progress_tx,
        read_buffer_size: if config.file_based_emummc {
            READ_BUFFER_SIZE_THROTTLED
        } else {
            READ_BUFFER_SIZE
        },
    };

    std::thread::scope(|scope| {
        scope.spawn(|| {
            let result = read_worker(&shared);
            shared.finish_stage(READ, result);
        });
        scope.spawn(|| {
            let result = decompress_worker(&shared);
            shared.finish_stage(DECOMPRESS, result);
        });
        scope.spawn(|| {
            let result = write_worker(&shared);
            shared.finish_stage(WRITE, result);
        });

        // progress pump; the timeout keeps it responsive to cancellation
        while shared.any_running() {
            match progress_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(()) => cx.sink.transfer(
                    shared.write_offset.load(Ordering::Acquire),
                    shared.write_size.load(Ordering::Acquire),
                ),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if cx.sink.is_cancelled() {
                shared.wake_all();
            }
        }
        shared.wake_all();
    });

    if let Some(header) = shared
        .header_out
        .lock()
        .expect("BUG: header mutex poisoned")
        .take()
    {
        nca.header = Some(header);
    }
    nca.modified = shared.modified.load(Ordering::Acquire);

    shared.take_results()?;

    let hash = shared
        .hash_out
        .lock()
        .expect("BUG: hash mutex poisoned")
        .take()
        .unwrap_or_default();
    nca.hash = hash;

    if !config.skip_nca_hash_verify {
        let actual = ContentId::from_hash(&hash);
        if nca.modified {
            // the rewritten bytes are the content's new identity
            nca.content_id = actual;
        } else if actual != nca.declared_id {
            warn!("{}: produced hash does not match", nca.entry.name);
            return Err(Error::InvalidNcaSha256 {
                expected: nca.declared_id,
                actual,
            });
        }
    }

    Ok(())
}
