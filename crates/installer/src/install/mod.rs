mod config;
mod error;
mod pipeline;
mod progress;
mod ring;

pub use config::{Config, ConfigOverride};
pub use error::{Error, Result};
pub use progress::{CancelToken, NullProgress, ProgressSink};

use crate::container::{self, CollectionEntry, Collections, ContainerKind};
use crate::crypto::keyset::KeySet;
use crate::formats::cnmt::{self, PackagedContentMeta};
use crate::formats::nca::{self, NcaHeader};
use crate::formats::ticket::{self, Ticket};
use crate::hexstring::HexData;
use crate::ids::{ContentId, PlaceholderId, RightsId, TitleId};
use crate::install::error::{
    CnmtSnafu, ContainerSnafu, MetaReadbackSnafu, NcaSnafu, SourceSnafu, StoreSnafu, TicketSnafu,
};
use crate::install::pipeline::PipelineContext;
use crate::ncm::{
    self, ApplicationRecords, ContentInfo, ContentMetaDb, ContentMetaHeader, ContentMetaKey,
    ContentMetaType, ContentStorage, ContentStorageRecord, ContentType, InstallType, StorageId,
    TicketStore,
};
use crate::source::{ByteSource, ByteSourceExt, FileSource};
use crate::version::Version;
use binrw::BinWriterExt;
use snafu::ResultExt;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// The external collaborators an install writes through. Both storages and
/// both databases stay open so downgrade and collision queries can cross
/// them; index 0 is built-in user storage, index 1 the SD card.
pub struct Services<'a> {
    pub content_storages: [&'a dyn ContentStorage; 2],
    pub meta_dbs: [&'a dyn ContentMetaDb; 2],
    pub ticket_store: &'a dyn TicketStore,
    pub application_records: &'a dyn ApplicationRecords,
}

static AUTO_SLEEP_SUPPRESSION: AtomicUsize = AtomicUsize::new(0);

/// True while any [`Installer`] is alive. Hosts that manage power can poll
/// this to keep the machine awake during long installs.
pub fn auto_sleep_suppressed() -> bool {
    AUTO_SLEEP_SUPPRESSION.load(Ordering::Acquire) > 0
}

/// Per-content install state.
#[derive(Debug, Clone)]
pub(crate) struct NcaInstall {
    pub entry: CollectionEntry,
    pub ty: ContentType,
    pub declared_id: ContentId,
    /// Final identity; diverges from `declared_id` when the header was
    /// rewritten.
    pub content_id: ContentId,
    pub placeholder_id: Option<PlaceholderId>,
    pub header: Option<NcaHeader>,
    pub hash: [u8; 0x20],
    pub modified: bool,
    pub skipped: bool,
}

impl NcaInstall {
    fn from_entry(entry: &CollectionEntry, ty: ContentType) -> Result<Self> {
        let declared_id =
            ContentId::from_entry_name(&entry.name).map_err(|_| Error::NcaNotFound {
                name: entry.name.clone(),
            })?;
        Ok(Self {
            entry: entry.clone(),
            ty,
            declared_id,
            content_id: declared_id,
            placeholder_id: None,
            header: None,
            hash: [0; 0x20],
            modified: false,
            skipped: false,
        })
    }
}

/// In-memory ticket/cert pair keyed by rights id.
#[derive(Debug, Clone)]
pub(crate) struct TicketRecord {
    pub rights_id: RightsId,
    pub ticket: Vec<u8>,
    pub cert: Vec<u8>,
    /// Key generation of the content that requires this ticket.
    pub key_generation: u8,
    pub required: bool,
    pub patched: bool,
}

#[derive(Debug, Clone)]
struct CnmtMeta {
    key: ContentMetaKey,
    header: ContentMetaHeader,
    extended_header: Vec<u8>,
    own_info: ContentInfo,
    infos: Vec<ContentInfo>,
}

struct CnmtInstall {
    nca: NcaInstall,
    /// The non-meta contents this cnmt references.
    ncas: Vec<NcaInstall>,
    meta: Option<CnmtMeta>,
}

pub struct Installer<'a> {
    services: Services<'a>,
    keys: KeySet,
    config: Config,
    sink: &'a dyn ProgressSink,
    storage_index: usize,
}

impl Drop for Installer<'_> {
    fn drop(&mut self) {
        AUTO_SLEEP_SUPPRESSION.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<'a> Installer<'a> {
    pub fn new(
        services: Services<'a>,
        keys: KeySet,
        config: &Config,
        overrides: &ConfigOverride,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        AUTO_SLEEP_SUPPRESSION.fetch_add(1, Ordering::AcqRel);
        let config = config.with_override(overrides);
        let storage_index = config.sd_card_install as usize;
        Self {
            services,
            keys,
            config,
            sink,
            storage_index,
        }
    }

    pub fn storage_id(&self) -> StorageId {
        if self.config.sd_card_install {
            StorageId::SdCard
        } else {
            StorageId::BuiltInUser
        }
    }

    fn storage(&self) -> &'a dyn ContentStorage {
        self.services.content_storages[self.storage_index]
    }

    fn meta_db(&self) -> &'a dyn ContentMetaDb {
        self.services.meta_dbs[self.storage_index]
    }

    fn pipeline_cx<'b>(&'b self, source: &'b dyn ByteSource) -> PipelineContext<'b> {
        PipelineContext {
            keys: &self.keys,
            config: &self.config,
            source,
            storage: self.storage(),
            sink: self.sink,
        }
    }

    /// Installs a container file, picking the layout from its extension.
    pub fn install_file(&mut self, path: &Path) -> Result<()> {
        let kind = ContainerKind::from_path(path).ok_or(Error::ContainerNotFound)?;
        let source = FileSource::open(path).context(SourceSnafu)?;
        self.install_source(kind, &source)
    }

    pub fn install_source(&mut self, kind: ContainerKind, source: &dyn ByteSource) -> Result<()> {
        let collections = container::collections(kind, source).context(ContainerSnafu)?;
        self.install_collections(source, collections)
    }

    pub fn install_collections(
        &mut self,
        source: &dyn ByteSource,
        collections: Collections,
    ) -> Result<()> {
        if source.is_stream() {
            self.install_stream(source, collections)
        } else {
            self.install_all(source, &collections)
        }
    }

    fn install_all(&mut self, source: &dyn ByteSource, collections: &Collections) -> Result<()> {
        let tickets = Mutex::new(self.parse_tickets(source, collections, true)?);

        let cnmts = collections
            .iter()
            .filter(|e| e.name.ends_with(".cnmt.nca") || e.name.ends_with(".cnmt.ncz"))
            .map(|e| {
                Ok(CnmtInstall {
                    nca: NcaInstall::from_entry(e, ContentType::Meta)?,
                    ncas: Vec::new(),
                    meta: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for mut cnmt in cnmts {
            let result = self.process_cnmt(source, &tickets, &mut cnmt, collections);
            self.cleanup_placeholders(&cnmt);
            result?;
        }

        info!("install finished");
        Ok(())
    }

    fn process_cnmt(
        &self,
        source: &dyn ByteSource,
        tickets: &Mutex<Vec<TicketRecord>>,
        cnmt: &mut CnmtInstall,
        collections: &Collections,
    ) -> Result<()> {
        self.install_cnmt_nca(source, tickets, cnmt, collections)?;

        let meta = cnmt.meta.clone().expect("BUG: cnmt meta parsed above");
        let (latest_version, skip) = self.latest_version(&meta)?;
        if skip || self.should_skip(&meta)? {
            info!("skipping install of {:?}", meta.key.id);
            return Ok(());
        }

        for nca in &mut cnmt.ncas {
            self.install_nca(source, tickets, nca)?;
        }

        self.import_tickets(&mut tickets.lock().expect("BUG: tickets mutex poisoned"))?;
        self.remove_installed(cnmt)?;
        self.register_and_push(cnmt, latest_version)
    }

    /// Builds ticket skeletons from the collection. Data is read eagerly
    /// for random-access sources and captured later for streams.
    fn parse_tickets(
        &self,
        source: &dyn ByteSource,
        collections: &Collections,
        read_data: bool,
    ) -> Result<Vec<TicketRecord>> {
        let mut tickets = Vec::new();
        for entry in collections {
            let Some(stem) = entry.name.strip_suffix(".tik") else {
                continue;
            };
            let Ok(rights_id) = RightsId::from_entry_name(&entry.name) else {
                warn!("ignoring ticket with malformed name: {}", entry.name);
                continue;
            };

            let cert_name = format!("{stem}.cert");
            let cert = collections
                .iter()
                .find(|e| e.name == cert_name)
                .ok_or_else(|| Error::CertNotFound {
                    name: entry.name.clone(),
                })?;

            let mut record = TicketRecord {
                rights_id,
                ticket: vec![0; entry.size as usize],
                cert: vec![0; cert.size as usize],
                key_generation: 0,
                required: false,
                patched: false,
            };

            if read_data {
                source
                    .read_exact_at(entry.offset, &mut record.ticket)
                    .context(SourceSnafu)?;
                source
                    .read_exact_at(cert.offset, &mut record.cert)
                    .context(SourceSnafu)?;
            }

            tickets.push(record);
        }
        Ok(tickets)
    }

    fn install_nca(
        &self,
        source: &dyn ByteSource,
        tickets: &Mutex<Vec<TicketRecord>>,
        nca: &mut NcaInstall,
    ) -> Result<()> {
        info!("installing {}", nca.entry.name);
        self.sink.new_transfer(&nca.entry.name);

        let cx = self.pipeline_cx(source);
        pipeline::install_content(&cx, tickets, nca)?;

        if !nca.skipped {
            self.storage().flush_placeholder().context(StoreSnafu)?;
        }
        Ok(())
    }

    /// Installs the meta NCA, then reads it back and resolves the cnmt:
    /// referenced contents, fixed header, extended header and the db key.
    fn install_cnmt_nca(
        &self,
        source: &dyn ByteSource,
        tickets: &Mutex<Vec<TicketRecord>>,
        cnmt: &mut CnmtInstall,
        collections: &Collections,
    ) -> Result<()> {
        self.install_nca(source, tickets, &mut cnmt.nca)?;

        let path = if cnmt.nca.skipped {
            self.storage()
                .get_content_path(cnmt.nca.content_id)
                .context(StoreSnafu)?
        } else {
            let placeholder_id = cnmt.nca.placeholder_id.expect("BUG: unskipped nca has a placeholder");
            self.storage()
                .get_placeholder_path(placeholder_id)
                .context(StoreSnafu)?
        };
        let bytes = std::fs::read(path).context(MetaReadbackSnafu)?;

        let header = cnmt.nca.header.expect("BUG: header parsed during install");
        let title_key = if header.has_rights_id() {
            let guard = tickets.lock().expect("BUG: tickets mutex poisoned");
            let record = guard
                .iter()
                .find(|t| t.rights_id == header.rights_id)
                .ok_or(Error::TicketNotFound {
                    rights_id: header.rights_id,
                })?;
            if record.ticket.is_empty() {
                None
            } else {
                let parsed = Ticket::parse(&record.ticket).context(TicketSnafu)?;
                Some(
                    parsed
                        .title_key_decrypted(&self.keys, header.key_generation())
                        .context(TicketSnafu)?,
                )
            }
        } else {
            None
        };

        let cnmt_bytes =
            nca::extract_meta_cnmt(&self.keys, &bytes, title_key).context(NcaSnafu)?;
        let packaged = PackagedContentMeta::parse(&cnmt_bytes).context(CnmtSnafu)?;
        debug!(
            "cnmt for {:?}: {} contents",
            packaged.header.title_id, packaged.header.content_count
        );

        let mut infos = Vec::new();
        for info in &packaged.content_infos {
            // delta fragments are never installed
            if info.ty == ContentType::DeltaFragment {
                continue;
            }

            let id_hex = info.content_id.to_string();
            let entry = collections
                .iter()
                .find(|e| e.name.contains(&id_hex))
                .ok_or_else(|| Error::NcaNotFound {
                    name: format!("{id_hex}.nca"),
                })?;

            infos.push(*info);
            cnmt.ncas.push(NcaInstall::from_entry(entry, info.ty)?);
        }

        let mut meta_header = packaged.header;
        meta_header.content_count = infos.len() as u16 + 1;
        meta_header.storage_id = 0;

        let key = ContentMetaKey {
            id: meta_header.title_id,
            version: meta_header.version,
            ty: meta_header.ty,
            install_type: InstallType::Full,
        };

        // the entry size lies for compressed metas, prefer the written size
        let own_size = cnmt
            .nca
            .header
            .map(|h| h.nca_size)
            .unwrap_or(cnmt.nca.entry.size);
        let own_info = ContentInfo {
            hash: HexData(cnmt.nca.hash),
            content_id: cnmt.nca.content_id,
            size: own_size,
            ty: ContentType::Meta,
            id_offset: 0,
        };

        let mut extended_header = packaged.extended_header;
        if self.config.lower_system_version
            && cnmt::lower_required_system_version(key.ty, &mut extended_header)
        {
            debug!("lowered required system version");
        }

        cnmt.ncas
            .sort_by_key(|nca| std::cmp::Reverse(nca.ty as u8));

        cnmt.meta = Some(CnmtMeta {
            key,
            header: meta_header,
            extended_header,
            own_info,
            infos,
        });
        Ok(())
    }

    /// Scans both databases for records of the same application: picks the
    /// newest version for the launch record and decides skips (already
    /// installed, or a blocked patch downgrade).
    fn latest_version(&self, meta: &CnmtMeta) -> Result<(Version, bool)> {
        let app_id = meta.key.application_id();
        let mut latest = meta.key.version;
        let mut skip = false;

        for db in self.services.meta_dbs {
            let keys = db
                .list(
                    None,
                    app_id,
                    (TitleId(0), TitleId(u64::MAX)),
                    InstallType::Full,
                )
                .context(StoreSnafu)?;

            for key in keys {
                debug!(
                    "found record: {:?} type {:?} version {}",
                    key.id, key.ty, key.version
                );

                if key.id == meta.key.id
                    && key.version == meta.key.version
                    && self.config.skip_if_already_installed
                {
                    skip = true;
                }

                if meta.key.ty == ContentMetaType::Patch {
                    if key.ty == meta.key.ty
                        && meta.key.version < key.version
                        && !self.config.allow_downgrade
                    {
                        info!("skipping downgrade to {}", meta.key.version);
                        skip = true;
                    }
                } else {
                    latest = std::cmp::max(latest, key.version);
                }
            }
        }

        Ok((latest, skip))
    }

    fn should_skip(&self, meta: &CnmtMeta) -> Result<bool> {
        if self.config.skip_if_already_installed
            && self.meta_db().has(meta.key).context(StoreSnafu)?
        {
            return Ok(true);
        }

        let ty = meta.key.ty;
        if !ty.is_installable() {
            debug!("skipping non-installable meta type {:?}", ty);
            return Ok(true);
        }

        Ok(match ty {
            ContentMetaType::Application => self.config.skip_base,
            ContentMetaType::Patch => self.config.skip_patch,
            ContentMetaType::AddOnContent => self.config.skip_addon,
            ContentMetaType::DataPatch => self.config.skip_data_patch,
            _ => false,
        })
    }

    fn import_tickets(&self, tickets: &mut [TicketRecord]) -> Result<()> {
        for record in tickets {
            if !(record.required || self.config.ticket_only) {
                continue;
            }
            if self.config.skip_ticket {
                warn!("skipping ticket install, but it's required!");
                continue;
            }

            if !record.patched {
                ticket::patch_ticket(
                    &mut record.ticket,
                    &self.keys,
                    record.key_generation,
                    self.config.convert_to_common_ticket,
                )
                .context(TicketSnafu)?;
                record.patched = true;
            }

            info!("importing ticket {}", record.rights_id);
            self.services
                .ticket_store
                .import_ticket(&record.ticket, &record.cert)
                .context(StoreSnafu)?;
            record.required = false;
        }
        Ok(())
    }

    /// Deletes superseded records and their contents from both storages,
    /// sparing contents shared with the new install.
    fn remove_installed(&self, cnmt: &CnmtInstall) -> Result<()> {
        let meta = cnmt.meta.as_ref().expect("BUG: cnmt meta parsed");
        let app_id = meta.key.application_id();

        // installing a patch removes all previously installed patches
        let id_range = if meta.key.ty == ContentMetaType::Patch {
            (TitleId(0), TitleId(u64::MAX))
        } else {
            (meta.key.id, meta.key.id)
        };

        for index in 0..2 {
            let cs = self.services.content_storages[index];
            let db = self.services.meta_dbs[index];

            let keys = db
                .list(Some(meta.key.ty), app_id, id_range, InstallType::Full)
                .context(StoreSnafu)?;

            for key in keys {
                debug!("removing old record {:?} v{}", key.id, key.version);
                let blob = db.get(key).context(StoreSnafu)?;
                ncm::parse_meta_header(&blob).map_err(|_| Error::NcmDbCorruptHeader)?;
                let infos =
                    ncm::parse_content_infos(&blob).map_err(|_| Error::NcmDbCorruptInfos)?;

                for info in infos {
                    // don't delete contents the new install shares
                    let shared = cnmt
                        .ncas
                        .iter()
                        .any(|n| n.declared_id == info.content_id && n.skipped)
                        || (info.content_id == cnmt.nca.content_id && cnmt.nca.skipped);
                    if shared {
                        continue;
                    }

                    match cs.delete(info.content_id) {
                        Ok(()) | Err(ncm::StoreError::ContentNotFound { .. }) => {}
                        Err(e) => return Err(Error::Store { source: e }),
                    }
                }

                db.remove(key).context(StoreSnafu)?;
                db.commit().context(StoreSnafu)?;
            }
        }
        Ok(())
    }

    /// Promotes every installed placeholder, writes the meta blob, commits
    /// and pushes the launcher record.
    fn register_and_push(&self, cnmt: &mut CnmtInstall, latest_version: Version) -> Result<()> {
        let meta = cnmt.meta.clone().expect("BUG: cnmt meta parsed");
        let app_id = meta.key.application_id();
        let cs = self.storage();

        if !cnmt.nca.skipped {
            let placeholder_id = cnmt.nca.placeholder_id.expect("BUG: unskipped nca has a placeholder");
            cs.register(cnmt.nca.content_id, placeholder_id)
                .context(StoreSnafu)?;
            cnmt.nca.placeholder_id = None;
        }

        for nca in &mut cnmt.ncas {
            if !nca.skipped && nca.ty != ContentType::DeltaFragment {
                let placeholder_id = nca.placeholder_id.expect("BUG: unskipped nca has a placeholder");
                cs.register(nca.content_id, placeholder_id)
                    .context(StoreSnafu)?;
                nca.placeholder_id = None;
            }
        }

        // meta blob: fixed header ∥ extended header ∥ own info ∥ content infos
        let mut blob = Cursor::new(Vec::new());
        blob.write_le(&meta.header)
            .expect("BUG: meta header must serialize");
        blob.write_le(&meta.extended_header)
            .expect("BUG: extended header must serialize");
        blob.write_le(&meta.own_info)
            .expect("BUG: content info must serialize");
        for info in &meta.infos {
            let mut info = *info;
            // a rewritten content registered under its produced hash
            if let Some(nca) = cnmt.ncas.iter().find(|n| n.declared_id == info.content_id) {
                info.content_id = nca.content_id;
            }
            blob.write_le(&info).expect("BUG: content info must serialize");
        }

        self.sink.new_transfer("Updating content meta database");
        let db = self.meta_db();
        db.set(meta.key, &blob.into_inner()).context(StoreSnafu)?;
        db.commit().context(StoreSnafu)?;

        self.sink.new_transfer("Pushing application record");
        let record = ContentStorageRecord {
            key: meta.key,
            storage_id: self.storage_id(),
        };
        self.services
            .application_records
            .push_record(app_id, &[record])
            .context(StoreSnafu)?;

        if self.services.application_records.system_version() >= (6, 0, 0) {
            self.services
                .application_records
                .push_launch_version(app_id, latest_version)
                .context(StoreSnafu)?;
        }

        info!("pushed application record for {app_id}");
        Ok(())
    }

    /// Deletes every placeholder that was not delivered to the store, on
    /// success, failure and cancellation alike.
    fn cleanup_placeholders(&self, cnmt: &CnmtInstall) {
        let cs = self.storage();
        for nca in std::iter::once(&cnmt.nca).chain(cnmt.ncas.iter()) {
            if let Some(id) = nca.placeholder_id {
                if let Err(e) = cs.delete_placeholder(id) {
                    debug!("placeholder cleanup: {e}");
                }
            }
        }
    }

    /// Forward-only install: contents are written as they stream past and
    /// ticket data is captured lazily, so registration happens at the end.
    fn install_stream(
        &mut self,
        source: &dyn ByteSource,
        mut collections: Collections,
    ) -> Result<()> {
        // not supported with stream installs (yet)
        self.config.skip_if_already_installed = false;
        self.config.convert_to_standard_crypto = false;
        self.config.lower_master_key = false;

        let tickets = Mutex::new(self.parse_tickets(source, &collections, false)?);
        collections.sort_by_key(|e| e.offset);

        let mut ncas: Vec<NcaInstall> = Vec::new();
        let mut cnmts: Vec<CnmtInstall> = Vec::new();

        let mut run = || -> Result<()> {
            for entry in &collections {
                if entry.name.ends_with(".cnmt.nca") || entry.name.ends_with(".cnmt.ncz") {
                    let mut cnmt = CnmtInstall {
                        nca: NcaInstall::from_entry(entry, ContentType::Meta)?,
                        ncas: Vec::new(),
                        meta: None,
                    };
                    self.install_cnmt_nca(source, &tickets, &mut cnmt, &collections)?;
                    cnmts.push(cnmt);
                } else if entry.name.ends_with(".nca") || entry.name.ends_with(".ncz") {
                    let mut nca = NcaInstall::from_entry(entry, ContentType::Data)?;
                    self.install_nca(source, &tickets, &mut nca)?;
                    ncas.push(nca);
                } else if entry.name.ends_with(".tik") || entry.name.ends_with(".cert") {
                    let Ok(rights_id) = RightsId::from_entry_name(&entry.name) else {
                        continue;
                    };
                    let mut guard = tickets.lock().expect("BUG: tickets mutex poisoned");
                    // this will never fail... but just in case
                    let record = guard
                        .iter_mut()
                        .find(|t| t.rights_id == rights_id)
                        .ok_or_else(|| Error::CertNotFound {
                            name: entry.name.clone(),
                        })?;

                    let buf = if entry.name.ends_with(".tik") {
                        &mut record.ticket
                    } else {
                        &mut record.cert
                    };
                    source.read_exact_at(entry.offset, buf).context(SourceSnafu)?;
                }
            }

            for cnmt in &mut cnmts {
                // fold the streamed install results into the cnmt's list
                for cnmt_nca in &mut cnmt.ncas {
                    let installed = ncas
                        .iter()
                        .find(|n| n.entry.name == cnmt_nca.entry.name)
                        .ok_or_else(|| Error::NcaNotFound {
                            name: cnmt_nca.entry.name.clone(),
                        })?;
                    let ty = cnmt_nca.ty;
                    *cnmt_nca = installed.clone();
                    cnmt_nca.ty = ty;
                }

                let meta = cnmt.meta.clone().expect("BUG: cnmt meta parsed above");
                let (latest_version, skip) = self.latest_version(&meta)?;
                if skip || self.should_skip(&meta)? {
                    info!("skipping install of {:?}", meta.key.id);
                    continue;
                }

                self.import_tickets(
                    &mut tickets.lock().expect("BUG: tickets mutex poisoned"),
                )?;
                self.remove_installed(cnmt)?;
                self.register_and_push(cnmt, latest_version)?;
            }

            Ok(())
        };

        let result = run();

        for cnmt in &cnmts {
            self.cleanup_placeholders(cnmt);
        }
        let cs = self.storage();
        for nca in &ncas {
            if let Some(id) = nca.placeholder_id {
                if let Err(e) = cs.delete_placeholder(id) {
                    debug!("placeholder cleanup: {e}");
                }
            }
        }

        result
    }
}
