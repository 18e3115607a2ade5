use crate::ids::TitleId;
use crate::ncm::{ApplicationRecords, ContentStorageRecord, StoreError, TicketStore};
use crate::version::Version;
use std::sync::Mutex;

/// Collects imported tickets in memory. Useful for tests and for hosts
/// without a real ticket service.
#[derive(Default)]
pub struct MemTicketStore {
    imported: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl MemTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn imported(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.imported
            .lock()
            .expect("BUG: ticket store mutex poisoned")
            .clone()
    }
}

impl TicketStore for MemTicketStore {
    fn import_ticket(&self, ticket: &[u8], cert: &[u8]) -> Result<(), StoreError> {
        self.imported
            .lock()
            .expect("BUG: ticket store mutex poisoned")
            .push((ticket.to_vec(), cert.to_vec()));
        Ok(())
    }
}

/// Collects pushed application records in memory.
pub struct MemApplicationRecords {
    system_version: (u32, u32, u32),
    records: Mutex<Vec<(TitleId, Vec<ContentStorageRecord>)>>,
    launch_versions: Mutex<Vec<(TitleId, Version)>>,
}

impl MemApplicationRecords {
    pub fn new() -> Self {
        Self::with_system_version((6, 0, 0))
    }

    pub fn with_system_version(system_version: (u32, u32, u32)) -> Self {
        Self {
            system_version,
            records: Mutex::new(Vec::new()),
            launch_versions: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<(TitleId, Vec<ContentStorageRecord>)> {
        self.records
            .lock()
            .expect("BUG: records mutex poisoned")
            .clone()
    }

    pub fn launch_versions(&self) -> Vec<(TitleId, Version)> {
        self.launch_versions
            .lock()
            .expect("BUG: records mutex poisoned")
            .clone()
    }
}

impl Default for MemApplicationRecords {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationRecords for MemApplicationRecords {
    fn push_record(
        &self,
        application_id: TitleId,
        records: &[ContentStorageRecord],
    ) -> Result<(), StoreError> {
        self.records
            .lock()
            .expect("BUG: records mutex poisoned")
            .push((application_id, records.to_vec()));
        Ok(())
    }

    fn push_launch_version(
        &self,
        application_id: TitleId,
        version: Version,
    ) -> Result<(), StoreError> {
        self.launch_versions
            .lock()
            .expect("BUG: records mutex poisoned")
            .push((application_id, version));
        Ok(())
    }

    fn system_version(&self) -> (u32, u32, u32) {
        self.system_version
    }
}
