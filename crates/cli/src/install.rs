use clap::Args;
use nx_install::crypto::keyset::KeySet;
use nx_install::install::{Config, ConfigOverride, Installer, ProgressSink, Services};
use nx_install::ncm::{FsContentStorage, FsMetaDb, FsTicketStore, MemApplicationRecords};
use nx_install::snafu::{ResultExt, Whatever};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct Opts {
    /// Container to install (nsp/nsz/xci/xcz).
    container: PathBuf,

    /// Root directory of the content store to install into.
    #[clap(long, default_value = "store")]
    store: PathBuf,

    /// Directory holding prod.keys (defaults to the system locations).
    #[clap(long)]
    keys: Option<PathBuf>,

    /// Install into the emulated SD card storage of the store.
    #[clap(long, default_value = "false")]
    sd: bool,

    #[clap(long, default_value = "false")]
    allow_downgrade: bool,
    #[clap(long, default_value = "false")]
    skip_if_already_installed: bool,
    #[clap(long, default_value = "false")]
    ticket_only: bool,
    #[clap(long, default_value = "false")]
    skip_nca_hash_verify: bool,
    #[clap(long, default_value = "false")]
    skip_rsa_header_fixed_key_verify: bool,
    #[clap(long, default_value = "false")]
    ignore_distribution_bit: bool,
    #[clap(long, default_value = "false")]
    convert_to_common_ticket: bool,
    #[clap(long, default_value = "false")]
    convert_to_standard_crypto: bool,
    #[clap(long, default_value = "false")]
    lower_master_key: bool,
    #[clap(long, default_value = "false")]
    lower_system_version: bool,
}

struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn new_transfer(&self, name: &str) {
        eprintln!("-> {name}");
    }

    fn transfer(&self, written: i64, total: i64) {
        eprint!("\r   {written} / {total} bytes");
        if written >= total {
            eprintln!();
        }
    }
}

pub fn main(opts: Opts) -> Result<(), Whatever> {
    let keys = KeySet::from_system(opts.keys.as_deref())
        .whatever_context("Loading the keyset")?;

    let builtin_cs = FsContentStorage::open(opts.store.join("user"))
        .whatever_context("Opening built-in content storage")?;
    let sd_cs = FsContentStorage::open(opts.store.join("sd"))
        .whatever_context("Opening sd content storage")?;
    let builtin_db = FsMetaDb::open(opts.store.join("user-db"))
        .whatever_context("Opening built-in meta db")?;
    let sd_db =
        FsMetaDb::open(opts.store.join("sd-db")).whatever_context("Opening sd meta db")?;
    let tickets = FsTicketStore::open(opts.store.join("tickets"))
        .whatever_context("Opening ticket store")?;
    let records = MemApplicationRecords::new();

    let config = Config {
        sd_card_install: opts.sd,
        allow_downgrade: opts.allow_downgrade,
        skip_if_already_installed: opts.skip_if_already_installed,
        ticket_only: opts.ticket_only,
        skip_nca_hash_verify: opts.skip_nca_hash_verify,
        skip_rsa_header_fixed_key_verify: opts.skip_rsa_header_fixed_key_verify,
        ignore_distribution_bit: opts.ignore_distribution_bit,
        convert_to_common_ticket: opts.convert_to_common_ticket,
        convert_to_standard_crypto: opts.convert_to_standard_crypto,
        lower_master_key: opts.lower_master_key,
        lower_system_version: opts.lower_system_version,
        ..Config::default()
    };

    let services = Services {
        content_storages: [&builtin_cs, &sd_cs],
        meta_dbs: [&builtin_db, &sd_db],
        ticket_store: &tickets,
        application_records: &records,
    };

    let sink = StderrProgress;
    let mut installer = Installer::new(services, keys, &config, &ConfigOverride::default(), &sink);
    installer
        .install_file(&opts.container)
        .whatever_context("Installing the container")?;

    for (app_id, records) in records.records() {
        println!(
            "installed {app_id}: {} record(s), storage {:?}",
            records.len(),
            records.first().map(|r| r.storage_id)
        );
    }

    Ok(())
}
