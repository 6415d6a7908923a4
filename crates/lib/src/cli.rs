//! # uefi-manager command line
//!
//! Command line tool to manage firmware boot entries and install EFI stubs.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use clap::builder::PossibleValuesParser;
use clap::Parser;
use comfy_table::presets::NOTHING;
use comfy_table::Table;
use fn_error_context::context;
use serde::Serialize;

use crate::config::{load_config, ManagerConfig};
use crate::efivars::{EfivarfsStore, VariableStore};
use crate::frugal::{self, FrugalInstall, PERSISTENCE_MODES};
use crate::load_option::BootId;
use crate::migrate::{self, MigrationRequest};
use crate::registry::{Registry, Schedule};
use crate::resolver::{PartitionIdentity, Resolver};
use crate::services::{
    CryptsetupUnlocker, Elevator, PartitionSource, PkexecElevator, SystemPartitions, Unlocker,
};
use crate::stub::{self, EspStubInstaller, StubInstaller, StubKind, StubSource};

/// Wrong passphrases accepted before giving up.
const PASSPHRASE_ATTEMPTS: u32 = 3;

/// Options for listing entries.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ListOpts {
    /// Also show device paths, partitions and load options.
    #[clap(long, short = 'v')]
    pub(crate) verbose: bool,

    /// Output in JSON format.
    #[clap(long, conflicts_with = "verbose")]
    pub(crate) json: bool,
}

/// Options for creating an entry.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct AddOpts {
    /// Description of the entry.
    #[clap(long)]
    pub(crate) label: String,

    /// Partition holding the loader, e.g. `sda1` or `/dev/nvme0n1p1`.
    #[clap(long)]
    pub(crate) partition: String,

    /// Loader path on that partition, e.g. `\EFI\debian\shimx64.efi`.
    #[clap(long)]
    pub(crate) loader: String,

    /// Arguments passed to the loader.
    #[clap(long)]
    pub(crate) options: Option<String>,

    /// Create the entry without scheduling it.
    #[clap(long)]
    pub(crate) inactive: bool,
}

/// Options for replacing an entry by label.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct MigrateOpts {
    /// Description of the entry to replace.
    #[clap(long)]
    pub(crate) old_label: String,

    /// Description of the replacement.
    #[clap(long)]
    pub(crate) new_label: String,

    /// Partition the replacement points at; must carry the same partition
    /// number as the one the old entry points at.
    #[clap(long)]
    pub(crate) target: String,

    /// Only consider this entry, when several carry the old label.
    #[clap(long)]
    pub(crate) entry: Option<BootId>,

    /// Loader path for the replacement; defaults to the old entry's.
    #[clap(long)]
    pub(crate) loader: Option<String>,

    /// Show what would be done without changing anything.
    #[clap(long)]
    pub(crate) dry_run: bool,
}

/// Options for inspecting a frugal install.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct FrugalInfoOpts {
    /// Partition holding the install.
    #[clap(long)]
    pub(crate) partition: String,

    /// Install directory relative to the partition root.
    #[clap(long)]
    pub(crate) dir: String,

    /// Output in JSON format.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Options for installing a kernel to the ESP and creating its entry.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InstallStubOpts {
    /// Partition holding the kernel: the root filesystem, or the
    /// filesystem holding the frugal install.
    #[clap(long)]
    pub(crate) partition: String,

    /// Directory with the kernel, relative to the partition root.
    /// Defaults to `/boot`; required with `--frugal`.
    #[clap(long)]
    pub(crate) dir: Option<String>,

    /// Install a frugal install's kernel instead of an installed system's.
    #[clap(long, requires = "dir")]
    pub(crate) frugal: bool,

    /// Install `vmlinuz-<VERSION>` rather than `vmlinuz`. Defaults to the
    /// running kernel when installing from `/`, else the newest `vmlinuz-*`.
    #[clap(long, conflicts_with = "frugal")]
    pub(crate) kernel_version: Option<String>,

    /// EFI system partition to install to; needed when there are several.
    #[clap(long)]
    pub(crate) esp: Option<String>,

    /// Entry description. A frugal install defaults to its GRUB title.
    #[clap(long)]
    pub(crate) label: Option<String>,

    /// Kernel arguments. Defaults to those configured for GRUB (stub), or
    /// those in `grub.entry` (frugal).
    #[clap(long)]
    pub(crate) options: Option<String>,

    /// Persistence mode of a frugal install.
    #[clap(long, requires = "frugal", value_parser = PossibleValuesParser::new(PERSISTENCE_MODES.iter().copied()))]
    pub(crate) persistence: Option<String>,
}

/// Options for man page generation.
#[cfg(feature = "docgen")]
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct ManOpts {
    /// Output to this directory.
    #[clap(long)]
    pub(crate) directory: Utf8PathBuf,
}

/// Manage firmware boot entries and install EFI stubs.
///
/// Changing boot variables requires root; when permission is denied the
/// command is run again through pkexec.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "uefi-manager")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// List boot entries in boot order, then unscheduled ones.
    #[clap(alias = "status")]
    List(ListOpts),
    /// Create an entry and append it to the boot order.
    Add(AddOpts),
    /// Delete an entry.
    Remove {
        /// Entry number, e.g. `0003` or `Boot0003`.
        id: BootId,
    },
    /// Replace the boot order.
    Order {
        /// Entry numbers in the desired order.
        #[clap(required = true, value_delimiter = ',')]
        ids: Vec<BootId>,
    },
    /// Mark an entry active and schedule it.
    Activate {
        /// Entry number.
        id: BootId,
    },
    /// Mark an entry inactive and unschedule it.
    Deactivate {
        /// Entry number.
        id: BootId,
    },
    /// Boot an entry once on the next boot.
    Next {
        /// Entry number.
        #[clap(required_unless_present = "clear")]
        id: Option<BootId>,
        /// Clear BootNext instead.
        #[clap(long, conflicts_with = "id")]
        clear: bool,
    },
    /// Set how long the firmware boot menu waits.
    Timeout {
        /// Seconds.
        #[clap(required_unless_present = "clear")]
        seconds: Option<u16>,
        /// Remove the timeout instead.
        #[clap(long, conflicts_with = "seconds")]
        clear: bool,
    },
    /// Change an entry's description.
    Rename {
        /// Entry number.
        id: BootId,
        /// New description.
        label: String,
    },
    /// Replace the entry carrying a label with one pointing at a given
    /// partition.
    Migrate(MigrateOpts),
    /// Show what a frugal install's grub.entry contains.
    FrugalInfo(FrugalInfoOpts),
    /// Copy a kernel to the ESP and create a firmware entry booting it.
    InstallStub(InstallStubOpts),
    /// Print the effective configuration.
    Config,
    /// Generate man pages.
    #[cfg(feature = "docgen")]
    #[clap(hide = true)]
    Man(ManOpts),
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

/// Whether the failure is a denied variable write that elevation may fix.
/// Only the outermost boot manager error counts, so partial failures are
/// never retried.
fn needs_elevation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<crate::Error>()
        .is_some_and(crate::Error::is_permission_denied)
}

fn run_from_opt(opt: Opt) -> Result<()> {
    let config = load_config()?;
    match run_command(&config, opt) {
        Err(e) if needs_elevation(&e) && !rustix::process::geteuid().is_root() => {
            tracing::debug!("{e:#}; retrying elevated");
            rerun_elevated(&config)
        }
        r => r,
    }
}

#[context("Re-running with elevated privileges")]
fn rerun_elevated(config: &ManagerConfig) -> Result<()> {
    let helpers = config.elevation();
    let elevator = PkexecElevator::detect(&helpers).ok_or_else(|| {
        anyhow!(
            "Permission denied, and none of {} is available to elevate",
            helpers.join(", ")
        )
    })?;
    let argv = uefimgr_utils::reexec::self_argv()?;
    let out = elevator.run_elevated(&argv)?;
    std::io::stdout().lock().write_all(&out.stdout)?;
    std::io::stderr().lock().write_all(&out.stderr)?;
    if out.elevation_refused() {
        anyhow::bail!("Authorization through {} was not granted", elevator.program());
    }
    if out.code != 0 {
        anyhow::bail!("Elevated command exited with status {}", out.code);
    }
    Ok(())
}

fn open_registry(config: &ManagerConfig) -> Result<Registry<EfivarfsStore>> {
    let store = EfivarfsStore::new(config.efivars());
    if !store.root().try_exists()? {
        anyhow::bail!("{} not found; this system was not booted in UEFI mode", store.root());
    }
    Ok(Registry::load(store)?)
}

/// Warn if the variable store is mounted read-only, which makes every
/// change fail regardless of privileges.
fn check_efivarfs_writable(efivars: &Utf8Path) {
    match uefimgr_mount::run_findmnt(&["--mountpoint"], Some(efivars.as_str())) {
        Ok(m) => {
            let ro = m
                .filesystems
                .iter()
                .any(|fs| fs.options.split(',').any(|o| o == "ro"));
            if ro {
                tracing::warn!("{efivars} is mounted read-only; remount it read-write to make changes");
            }
        }
        Err(e) => tracing::debug!("Checking {efivars} mount options: {e:#}"),
    }
}

fn run_command(config: &ManagerConfig, opt: Opt) -> Result<()> {
    if !matches!(opt, Opt::List(_) | Opt::FrugalInfo(_) | Opt::Config) {
        check_efivarfs_writable(&config.efivars());
    }
    let out = &mut std::io::stdout().lock();
    match opt {
        Opt::List(opts) => {
            let registry = open_registry(config)?;
            if opts.verbose {
                let partitions = SystemPartitions::new(&config.mount_base());
                let resolver = Resolver::new(&partitions);
                print_listing(out, &registry, Some(&resolver))
            } else if opts.json {
                print_listing_json(out, &registry)
            } else {
                print_listing(out, &registry, None)
            }
        }
        Opt::Add(opts) => {
            let mut registry = open_registry(config)?;
            let partitions = SystemPartitions::new(&config.mount_base());
            add_entry(out, &mut registry, &Resolver::new(&partitions), &opts)
        }
        Opt::Remove { id } => Ok(open_registry(config)?.remove(id)?),
        Opt::Order { ids } => Ok(open_registry(config)?.reorder(&ids)?),
        Opt::Activate { id } => Ok(open_registry(config)?.set_active(id, true)?),
        Opt::Deactivate { id } => Ok(open_registry(config)?.set_active(id, false)?),
        Opt::Next { id, clear } => Ok(open_registry(config)?.set_next(id.filter(|_| !clear))?),
        Opt::Timeout { seconds, clear } => {
            Ok(open_registry(config)?.set_timeout(seconds.filter(|_| !clear))?)
        }
        Opt::Rename { id, label } => Ok(open_registry(config)?.rename(id, &label)?),
        Opt::Migrate(opts) => {
            let mut registry = open_registry(config)?;
            let partitions = SystemPartitions::new(&config.mount_base());
            run_migrate(out, &mut registry, &Resolver::new(&partitions), &opts)
        }
        Opt::FrugalInfo(opts) => {
            // Declared first so mappings outlive the mounts on them
            let unlocker = CryptsetupUnlocker::new();
            let partitions = SystemPartitions::new(&config.mount_base());
            let resolver = Resolver::new(&partitions);
            let part = resolver.resolve_device(&opts.partition)?;
            let mountpoint = mount_partition(&resolver, &unlocker, &part, &prompt_passphrase)?;
            let f = frugal::read_frugal_dir(&frugal::install_path(&mountpoint, &opts.dir), &opts.dir)?;
            print_frugal(out, &f, opts.json)
        }
        Opt::InstallStub(opts) => {
            let unlocker = CryptsetupUnlocker::new();
            let partitions = SystemPartitions::new(&config.mount_base());
            let mut registry = open_registry(config)?;
            let resolver = Resolver::new(&partitions);
            let installer = EspStubInstaller::default();
            let ctx = InstallContext {
                resolver: &resolver,
                unlocker: &unlocker,
                installer: &installer,
                distro: config.distro.clone(),
                prompt: &prompt_passphrase,
            };
            install_stub(out, &mut registry, &ctx, &opts)
        }
        Opt::Config => {
            let effective = ManagerConfig {
                efivars: Some(config.efivars()),
                mount_base: Some(config.mount_base()),
                elevation: Some(config.elevation()),
                distro: config.distro.clone(),
            };
            writeln!(out, "[manager]")?;
            write!(out, "{}", toml::to_string(&effective)?)?;
            Ok(())
        }
        #[cfg(feature = "docgen")]
        Opt::Man(opts) => crate::docgen::generate_manpages(&opts.directory),
    }
}

fn order_cell(schedule: Schedule) -> String {
    match schedule {
        Schedule::Position(p) => (p + 1).to_string(),
        Schedule::Unscheduled => "-".into(),
    }
}

fn print_listing<S: VariableStore>(
    out: &mut impl Write,
    registry: &Registry<S>,
    resolver: Option<&Resolver<'_>>,
) -> Result<()> {
    let listing = registry.list();
    let opt_id = |id: Option<BootId>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
    writeln!(out, "BootCurrent: {}", opt_id(listing.current))?;
    writeln!(out, "BootNext: {}", opt_id(listing.next))?;
    match listing.timeout {
        Some(t) => writeln!(out, "Timeout: {t} seconds")?,
        None => writeln!(out, "Timeout: -")?,
    }
    if listing.entries.is_empty() {
        writeln!(out, "No boot entries")?;
        return Ok(());
    }
    let mut table = Table::new();
    table.load_preset(NOTHING);
    let mut header = vec!["Boot", "Order", "Active", "Label"];
    if resolver.is_some() {
        header.extend(["Partition", "Device path", "Options"]);
    }
    table.set_header(header);
    for e in &listing.entries {
        let entry = &e.entry;
        let marker = if listing.current == Some(entry.id) { "*" } else { "" };
        let mut row = vec![
            format!("{}{marker}", entry.id),
            order_cell(e.schedule),
            if entry.active { "yes" } else { "no" }.to_string(),
            entry.description.clone(),
        ];
        if let Some(resolver) = resolver {
            let partition = match entry.device_path.hard_drive() {
                None => "-".to_string(),
                Some(_) => match resolver.resolve(&entry.device_path) {
                    Ok(p) => p.device.to_string(),
                    Err(e) => {
                        tracing::debug!("Boot{}: {e}", entry.id);
                        "?".to_string()
                    }
                },
            };
            row.push(partition);
            row.push(entry.device_path.to_string());
            row.push(entry.payload_text().unwrap_or_default());
        }
        table.add_row(row);
    }
    writeln!(out, "{table}")?;
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct JsonEntry<'a> {
    id: BootId,
    description: &'a str,
    active: bool,
    schedule: Schedule,
    device_path: String,
    load_options: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct JsonListing<'a> {
    boot_current: Option<BootId>,
    boot_next: Option<BootId>,
    timeout: Option<u16>,
    entries: Vec<JsonEntry<'a>>,
}

fn print_listing_json<S: VariableStore>(out: &mut impl Write, registry: &Registry<S>) -> Result<()> {
    let listing = registry.list();
    let entries = listing
        .entries
        .iter()
        .map(|e| JsonEntry {
            id: e.entry.id,
            description: &e.entry.description,
            active: e.entry.active,
            schedule: e.schedule,
            device_path: e.entry.device_path.to_string(),
            load_options: e.entry.payload_text(),
        })
        .collect();
    let j = JsonListing {
        boot_current: listing.current,
        boot_next: listing.next,
        timeout: listing.timeout,
        entries,
    };
    serde_json::to_writer_pretty(&mut *out, &j)?;
    writeln!(out)?;
    Ok(())
}

fn add_entry<S: VariableStore>(
    out: &mut impl Write,
    registry: &mut Registry<S>,
    resolver: &Resolver<'_>,
    opts: &AddOpts,
) -> Result<()> {
    let partition = resolver.resolve_device(&opts.partition)?;
    let payload = opts.options.as_deref().map(stub::encode_load_options);
    let mut template = crate::load_option::BootEntry::new(
        BootId(0),
        opts.label.as_str(),
        Resolver::build(&partition, &opts.loader),
        payload,
    );
    template.active = !opts.inactive;
    let e = registry.add_entry(template)?;
    writeln!(out, "Created Boot{} '{}'", e.id, e.description)?;
    Ok(())
}

fn run_migrate<S: VariableStore>(
    out: &mut impl Write,
    registry: &mut Registry<S>,
    resolver: &Resolver<'_>,
    opts: &MigrateOpts,
) -> Result<()> {
    let req = MigrationRequest {
        old_label: &opts.old_label,
        new_label: &opts.new_label,
        entry: opts.entry,
        target: &opts.target,
        loader: opts.loader.as_deref(),
    };
    let ctx = migrate::plan(registry, resolver, &req)?;
    let old = ctx.old_entry();
    writeln!(
        out,
        "Replacing Boot{} '{}' on {} with '{}' on {}: {}",
        old.id,
        ctx.old_label(),
        ctx.resolved_partition().device,
        ctx.new_label(),
        ctx.target().device,
        ctx.device_path()
    )?;
    if opts.dry_run {
        return Ok(());
    }
    let outcome = migrate::apply(registry, &ctx)?;
    writeln!(out, "Created Boot{}", outcome.created.id)?;
    Ok(())
}

fn print_frugal(out: &mut impl Write, f: &FrugalInstall, json: bool) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, f)?;
        writeln!(out)?;
        return Ok(());
    }
    let none = || "-".to_string();
    writeln!(out, "Label: {}", f.label)?;
    writeln!(out, "Directory: {}", f.bdir.clone().unwrap_or_else(none))?;
    writeln!(out, "Partition UUID: {}", f.uuid.clone().unwrap_or_else(none))?;
    writeln!(
        out,
        "Persistence: {}",
        f.persistence.clone().unwrap_or_else(none)
    )?;
    writeln!(out, "Options: {}", f.options)?;
    Ok(())
}

fn prompt_passphrase(device: &Utf8Path) -> Result<Vec<u8>> {
    let p = dialoguer::Password::new()
        .with_prompt(format!("Passphrase to unlock {device}"))
        .interact()
        .context("Reading passphrase")?;
    Ok(p.into_bytes())
}

/// Mount `part`, unlocking it first if it is encrypted. A wrong passphrase
/// is asked for again a limited number of times.
fn mount_partition(
    resolver: &Resolver<'_>,
    unlocker: &dyn Unlocker,
    part: &PartitionIdentity,
    prompt: &dyn Fn(&Utf8Path) -> Result<Vec<u8>>,
) -> Result<Utf8PathBuf> {
    let part = if part.is_encrypted() {
        let mut attempts = 1;
        loop {
            let passphrase = prompt(&part.device)?;
            match Resolver::unlock_if_encrypted(part, unlocker, Some(passphrase)) {
                Err(crate::Error::WrongPassphrase(dev)) if attempts < PASSPHRASE_ATTEMPTS => {
                    attempts += 1;
                    eprintln!("Wrong passphrase for {dev}");
                }
                r => break r?,
            }
        }
    } else {
        part.clone()
    };
    resolver.source().mount(&part)
}

/// The ESP to install to: the requested one, or the only one present.
fn select_esp(resolver: &Resolver<'_>, requested: Option<&str>) -> Result<PartitionIdentity> {
    if let Some(dev) = requested {
        let p = resolver.resolve_device(dev)?;
        anyhow::ensure!(p.is_esp(), "{} is not an EFI system partition", p.device);
        return Ok(p);
    }
    let esps = resolver
        .partitions()?
        .into_iter()
        .filter(PartitionIdentity::is_esp)
        .collect::<Vec<_>>();
    match esps.as_slice() {
        [] => anyhow::bail!("No EFI system partition found"),
        [one] => Ok(one.clone()),
        many => anyhow::bail!(
            "Multiple EFI system partitions found ({}); choose one with --esp",
            many.iter()
                .map(|p| p.device.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Collaborators for [`install_stub`].
struct InstallContext<'a> {
    resolver: &'a Resolver<'a>,
    unlocker: &'a dyn Unlocker,
    installer: &'a dyn StubInstaller,
    distro: Option<String>,
    prompt: &'a dyn Fn(&Utf8Path) -> Result<Vec<u8>>,
}

#[context("Installing EFI stub")]
fn install_stub<S: VariableStore>(
    out: &mut impl Write,
    registry: &mut Registry<S>,
    ctx: &InstallContext<'_>,
    opts: &InstallStubOpts,
) -> Result<()> {
    let part = ctx.resolver.resolve_device(&opts.partition)?;
    let mountpoint = mount_partition(ctx.resolver, ctx.unlocker, &part, ctx.prompt)?;
    let dir = opts.dir.as_deref().unwrap_or("/boot");
    let source_dir = frugal::install_path(&mountpoint, dir);

    let (kind, label, options) = if opts.frugal {
        let mut f = frugal::read_frugal_dir(&source_dir, dir)?;
        if let Some(p) = &opts.persistence {
            f.persistence = Some(p.clone());
        }
        if let Some(o) = &opts.options {
            f.options = o.clone();
        }
        if f.uuid.is_none() {
            f.uuid = part.filesystem_uuid.clone();
        }
        let label = opts.label.clone().unwrap_or_else(|| f.label.clone());
        (StubKind::Frugal, label, Some(f))
    } else {
        let label = opts
            .label
            .clone()
            .ok_or_else(|| anyhow!("--label is required"))?;
        (StubKind::Stub, label, None)
    };
    anyhow::ensure!(!label.is_empty(), "The entry label must not be empty");

    let root = Dir::open_ambient_dir(&mountpoint, cap_std::ambient_authority())
        .with_context(|| format!("Opening {mountpoint}"))?;
    let distro = match &ctx.distro {
        Some(d) => d.clone(),
        None => stub::distro_id(&root),
    };
    let kernel_version = match (&opts.kernel_version, kind) {
        (Some(v), _) => Some(v.clone()),
        (None, StubKind::Frugal) => None,
        (None, StubKind::Stub) => {
            let boot = Dir::open_ambient_dir(&source_dir, cap_std::ambient_authority())
                .with_context(|| format!("Opening {source_dir}"))?;
            let running = if mountpoint == "/" {
                stub::running_kernel()
            } else {
                None
            };
            let v = stub::select_kernel(&boot, running.as_deref())?;
            if let Some(v) = &v {
                tracing::debug!("Selected kernel {v}");
            }
            v
        }
    };
    let esp = select_esp(ctx.resolver, opts.esp.as_deref())?;
    let esp_mount = ctx.resolver.source().mount(&esp)?;
    let source = StubSource {
        dir: source_dir,
        kind,
        kernel_version,
    };
    let installed = ctx.installer.install(&esp_mount, &distro, &source)?;
    let load_options = match &options {
        Some(f) => f.load_options(&installed.initrd_args()),
        None => {
            let user = match &opts.options {
                Some(o) => o.clone(),
                None => stub_options(&root, &part, dir, &source)?,
            };
            stub::stub_load_options(&user, &installed)
        }
    };
    let entry = stub::register_stub(registry, &esp, &label, &installed, &load_options)?;
    writeln!(
        out,
        "Created Boot{} '{}': {} {}",
        entry.id, entry.description, installed.loader, load_options
    )?;
    Ok(())
}

/// Kernel arguments for a stub install without `--options`: the matching
/// `linux` line of the installed system's `grub.cfg`, else ones built from
/// its root filesystem.
fn stub_options(
    root: &Dir,
    part: &PartitionIdentity,
    dir: &str,
    source: &StubSource,
) -> Result<String> {
    let fallback = || stub::fallback_options(root, part.filesystem_uuid.as_deref());
    let Some(version) = &source.kernel_version else {
        return Ok(fallback());
    };
    let boot = Dir::open_ambient_dir(&source.dir, cap_std::ambient_authority())
        .with_context(|| format!("Opening {}", source.dir))?;
    // grub.cfg paths are relative to the partition holding the kernel
    let kernel_dir = dir.trim_end_matches('/');
    let kernel_dir = if kernel_dir.is_empty() || kernel_dir.starts_with('/') {
        kernel_dir.to_string()
    } else {
        format!("/{kernel_dir}")
    };
    let mut roots = vec![part.device.to_string()];
    roots.extend(part.filesystem_uuid.iter().map(|u| format!("UUID={u}")));
    let vmlinuz = format!("vmlinuz-{version}");
    Ok(stub::grub_cfg_options(&boot, &kernel_dir, &vmlinuz, &roots).unwrap_or_else(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::efivars::MemoryStore;
    use crate::resolver::ESP_PARTTYPE_GPT;
    use crate::testutil::{gpt_partition, seeded_store, FakePartitions, FakeUnlocker};

    fn esp(disk: &str, n: u32) -> PartitionIdentity {
        PartitionIdentity {
            parttype: Some(ESP_PARTTYPE_GPT.into()),
            fstype: Some("vfat".into()),
            ..gpt_partition(disk, n, 0xe5 + u128::from(n))
        }
    }

    #[test]
    fn test_parse_args() {
        let o = Opt::try_parse_from(["uefi-manager", "order", "3,1", "Boot0002"]).unwrap();
        assert_eq!(
            o,
            Opt::Order {
                ids: vec![BootId(3), BootId(1), BootId(2)]
            }
        );
        let o = Opt::try_parse_from(["uefi-manager", "next", "--clear"]).unwrap();
        assert_eq!(o, Opt::Next { id: None, clear: true });
        assert!(Opt::try_parse_from(["uefi-manager", "next"]).is_err());
        assert!(Opt::try_parse_from(["uefi-manager", "timeout", "70000"]).is_err());
        assert!(Opt::try_parse_from(["uefi-manager", "remove", "xyz"]).is_err());
        assert!(Opt::try_parse_from(["uefi-manager", "list", "--json", "-v"]).is_err());
        assert!(Opt::try_parse_from([
            "uefi-manager",
            "install-stub",
            "--partition",
            "sda2",
            "--frugal"
        ])
        .is_err());
        let o = Opt::try_parse_from([
            "uefi-manager",
            "install-stub",
            "--partition",
            "sda2",
            "--frugal",
            "--dir",
            "MX-Frugal",
            "--persistence",
            "persist_home",
        ])
        .unwrap();
        assert!(matches!(o, Opt::InstallStub(InstallStubOpts { frugal: true, .. })));
        assert!(Opt::try_parse_from([
            "uefi-manager",
            "install-stub",
            "--partition",
            "sda2",
            "--frugal",
            "--dir",
            "x",
            "--persistence",
            "frugal_persist",
        ])
        .is_err());
    }

    #[test]
    fn test_needs_elevation() {
        let e: anyhow::Error = crate::Error::PermissionDenied("BootOrder".into()).into();
        assert!(needs_elevation(&e));
        assert!(needs_elevation(&e.context("Setting order")));
        let e: anyhow::Error = crate::Error::PartialRemove {
            id: BootId(1),
            source: Box::new(crate::Error::PermissionDenied("BootOrder".into())),
        }
        .into();
        assert!(!needs_elevation(&e));
        assert!(!needs_elevation(&anyhow!("permission denied")));
    }

    #[test]
    fn test_listing() {
        let store = seeded_store(&[(1, "MX Linux", true), (2, "Windows", false)], &[1])
            .with_variable(crate::efivars::VariableName::boot_current(), vec![1, 0]);
        let r = Registry::load(store).unwrap();
        let mut buf = Vec::new();
        print_listing(&mut buf, &r, None).unwrap();
        let s = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = s.lines().map(str::trim_end).collect();
        assert_eq!(lines[..3], ["BootCurrent: 0001", "BootNext: -", "Timeout: -"]);
        let row = |label: &str| lines.iter().find(|l| l.contains(label)).copied().unwrap();
        assert!(row("MX Linux").contains("0001*"));
        assert!(row("Windows").contains(" - "));
        assert!(!row("Windows").contains('*'));

        let parts = FakePartitions::new(vec![gpt_partition("sda", 1, 1)]);
        let resolver = Resolver::new(&parts);
        let mut buf = Vec::new();
        print_listing(&mut buf, &r, Some(&resolver)).unwrap();
        let s = String::from_utf8(buf).unwrap();
        assert!(s.contains("/dev/sda1"));
        assert!(s.contains("\\EFI\\test\\grubx64.efi"));
    }

    #[test]
    fn test_timeout_scenario() {
        let mut r = Registry::load(MemoryStore::new()).unwrap();
        r.set_timeout(Some(30)).unwrap();
        let mut buf = Vec::new();
        print_listing_json(&mut buf, &r).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["timeout"], 30);
        assert_eq!(v["entries"], serde_json::json!([]));
        assert_eq!(v["boot-next"], serde_json::Value::Null);
    }

    #[test]
    fn test_listing_json() {
        let store = seeded_store(&[(1, "a", true), (4, "b", false)], &[1]);
        let r = Registry::load(store).unwrap();
        let mut buf = Vec::new();
        print_listing_json(&mut buf, &r).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(v["entries"][0]["id"], "0001");
        assert_eq!(v["entries"][0]["schedule"], serde_json::json!({"position": 0}));
        assert_eq!(v["entries"][1]["schedule"], "unscheduled");
        assert_eq!(v["entries"][1]["active"], false);
    }

    #[test]
    fn test_add_and_migrate() {
        let mut r = Registry::load(seeded_store(&[(2, "old", true)], &[2])).unwrap();
        let parts = FakePartitions::new((1..=3).map(|n| gpt_partition("sda", n, n.into())).collect());
        let resolver = Resolver::new(&parts);
        let opts = AddOpts {
            label: "extra".into(),
            partition: "sda3".into(),
            loader: "/EFI/extra/loader.efi".into(),
            options: Some("quiet".into()),
            inactive: true,
        };
        add_entry(&mut Vec::new(), &mut r, &resolver, &opts).unwrap();
        let e = r.find_by_label("extra")[0].clone();
        assert!(!e.active);
        assert_eq!(e.payload_text().as_deref(), Some("quiet"));
        assert_eq!(r.state().order, vec![BootId(2)]);

        let mut opts = MigrateOpts {
            old_label: "old".into(),
            new_label: "new".into(),
            target: "sda2".into(),
            entry: None,
            loader: None,
            dry_run: true,
        };
        let mut buf = Vec::new();
        run_migrate(&mut buf, &mut r, &resolver, &opts).unwrap();
        assert!(String::from_utf8(buf).unwrap().starts_with("Replacing Boot0002 'old' on /dev/sda2"));
        assert!(r.store().operations().iter().all(|op| !matches!(op, crate::efivars::StoreOp::Delete(_))));

        opts.dry_run = false;
        run_migrate(&mut Vec::new(), &mut r, &resolver, &opts).unwrap();
        assert_eq!(r.find_by_label("new").len(), 1);
        assert_eq!(r.state().order.len(), 1);
    }

    #[test]
    fn test_mount_partition() {
        let mut root = gpt_partition("sda", 2, 2);
        let parts = FakePartitions::new(vec![root.clone()])
            .with_mount("/dev/sda2", "/mnt/test/sda2")
            .with_mount("/dev/mapper/luks-test", "/mnt/test/root");
        let resolver = Resolver::new(&parts);
        let unlocker = FakeUnlocker::new(b"secret");
        let never = |_: &Utf8Path| -> Result<Vec<u8>> { panic!("not encrypted") };
        assert_eq!(
            mount_partition(&resolver, &unlocker, &root, &never).unwrap().as_str(),
            "/mnt/test/sda2"
        );

        root.fstype = Some("crypto_LUKS".into());
        let answers = std::cell::RefCell::new(vec![b"secret".to_vec(), b"guess".to_vec()]);
        let prompt = |_: &Utf8Path| -> Result<Vec<u8>> {
            answers.borrow_mut().pop().ok_or_else(|| anyhow!("no more answers"))
        };
        assert_eq!(
            mount_partition(&resolver, &unlocker, &root, &prompt).unwrap().as_str(),
            "/mnt/test/root"
        );
        let mounted = parts.mounted.borrow().iter().map(|p| p.to_string()).collect::<Vec<_>>();
        assert_eq!(mounted, ["/dev/sda2", "/dev/mapper/luks-test"]);

        // Gives up after repeated wrong passphrases
        let prompt = |_: &Utf8Path| -> Result<Vec<u8>> { Ok(b"wrong".to_vec()) };
        let err = mount_partition(&resolver, &unlocker, &root, &prompt).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::Error>(),
            Some(crate::Error::WrongPassphrase(_))
        ));
    }

    #[test]
    fn test_select_esp() {
        let parts = FakePartitions::new(vec![gpt_partition("sda", 2, 2)]);
        let resolver = Resolver::new(&parts);
        assert!(select_esp(&resolver, None).is_err());
        assert!(select_esp(&resolver, Some("sda2")).is_err());

        let parts = FakePartitions::new(vec![esp("sda", 1), gpt_partition("sda", 2, 2)]);
        let resolver = Resolver::new(&parts);
        assert_eq!(select_esp(&resolver, None).unwrap().device, "/dev/sda1");

        let parts = FakePartitions::new(vec![esp("sda", 1), esp("nvme0n1", 1)]);
        let resolver = Resolver::new(&parts);
        let err = select_esp(&resolver, None).unwrap_err();
        assert!(err.to_string().contains("/dev/sda1, /dev/nvme0n1p1"));
        assert_eq!(
            select_esp(&resolver, Some("nvme0n1p1")).unwrap().device,
            "/dev/nvme0n1p1"
        );
    }

    #[test]
    fn test_install_stub_frugal() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let install = root.join("data/MX-Frugal");
        std::fs::create_dir_all(&install)?;
        for (name, data) in [("vmlinuz", "k"), ("initrd.gz", "i"), ("linuxfs", "fs")] {
            std::fs::write(install.join(name), data)?;
        }
        std::fs::write(
            install.join("grub.entry"),
            "menuentry \"MX frugal\" {\n linux /MX-Frugal/vmlinuz bdir=MX-Frugal quiet frugal_persist\n}\n",
        )?;
        std::fs::create_dir_all(root.join("esp"))?;

        let data = gpt_partition("sda", 2, 2);
        let parts = FakePartitions::new(vec![esp("sda", 1), data.clone()])
            .with_mount("/dev/sda1", root.join("esp"))
            .with_mount("/dev/sda2", root.join("data"));
        let resolver = Resolver::new(&parts);
        let unlocker = FakeUnlocker::new(b"");
        let installer = EspStubInstaller {
            skip_space_check: true,
        };
        let prompt = |_: &Utf8Path| -> Result<Vec<u8>> { unreachable!() };
        let ctx = InstallContext {
            resolver: &resolver,
            unlocker: &unlocker,
            installer: &installer,
            distro: Some("MX".into()),
            prompt: &prompt,
        };
        let opts = InstallStubOpts {
            partition: "sda2".into(),
            dir: Some("MX-Frugal".into()),
            frugal: true,
            kernel_version: None,
            esp: None,
            label: None,
            options: None,
            persistence: Some("persist_root".into()),
        };
        let mut r = Registry::load(MemoryStore::new())?;
        let mut buf = Vec::new();
        install_stub(&mut buf, &mut r, &ctx, &opts)?;

        let e = r.find_by_label("MX frugal")[0].clone();
        assert_eq!(e.device_path.file_path(), Some("\\EFI\\MX\\frugal\\vmlinuz"));
        assert_eq!(
            e.payload_text().unwrap(),
            format!(
                "bdir=MX-Frugal buuid={} quiet persist_root initrd=\\EFI\\MX\\frugal\\initrd.img",
                data.filesystem_uuid.as_deref().unwrap()
            )
        );
        assert!(root.join("esp/EFI/MX/frugal/vmlinuz").exists());
        assert_eq!(r.state().order, vec![e.id]);
        Ok(())
    }

    #[test]
    fn test_install_stub_selects_kernel() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let boot = root.join("data/boot");
        std::fs::create_dir_all(boot.join("grub"))?;
        for name in [
            "vmlinuz-6.1.0-37-amd64",
            "initrd.img-6.1.0-37-amd64",
            "vmlinuz-6.12.1-1-amd64",
            "initrd.img-6.12.1-1-amd64",
        ] {
            std::fs::write(boot.join(name), name)?;
        }
        let data = gpt_partition("sda", 2, 2);
        let uuid = data.filesystem_uuid.clone().unwrap();
        std::fs::write(
            boot.join("grub/grub.cfg"),
            format!(
                "menuentry 'MX' {{\n\tlinux /boot/vmlinuz-6.12.1-1-amd64 root=UUID={uuid} ro quiet\n}}\n"
            ),
        )?;
        std::fs::create_dir_all(root.join("esp"))?;

        let parts = FakePartitions::new(vec![esp("sda", 1), data])
            .with_mount("/dev/sda1", root.join("esp"))
            .with_mount("/dev/sda2", root.join("data"));
        let resolver = Resolver::new(&parts);
        let unlocker = FakeUnlocker::new(b"");
        let installer = EspStubInstaller {
            skip_space_check: true,
        };
        let prompt = |_: &Utf8Path| -> Result<Vec<u8>> { unreachable!() };
        let ctx = InstallContext {
            resolver: &resolver,
            unlocker: &unlocker,
            installer: &installer,
            distro: Some("MX".into()),
            prompt: &prompt,
        };
        let opts = InstallStubOpts {
            partition: "sda2".into(),
            dir: None,
            frugal: false,
            kernel_version: None,
            esp: None,
            label: Some("MX stub".into()),
            options: None,
            persistence: None,
        };
        let mut r = Registry::load(MemoryStore::new())?;
        let mut buf = Vec::new();
        install_stub(&mut buf, &mut r, &ctx, &opts)?;

        // The newest kernel, with the arguments grub boots it with
        let e = r.find_by_label("MX stub")[0].clone();
        assert_eq!(
            e.payload_text().unwrap(),
            format!("root=UUID={uuid} ro quiet initrd=\\EFI\\MX\\stub\\initrd.img")
        );
        assert_eq!(
            std::fs::read_to_string(root.join("esp/EFI/MX/stub/vmlinuz"))?,
            "vmlinuz-6.12.1-1-amd64"
        );

        // An explicit version without a grub.cfg line falls back to the root UUID
        let opts = InstallStubOpts {
            kernel_version: Some("6.1.0-37-amd64".into()),
            label: Some("MX old".into()),
            ..opts
        };
        install_stub(&mut buf, &mut r, &ctx, &opts)?;
        let e = r.find_by_label("MX old")[0].clone();
        assert_eq!(
            e.payload_text().unwrap(),
            format!("root=UUID={uuid} initrd=\\EFI\\MX\\stub\\initrd.img")
        );
        assert_eq!(
            std::fs::read_to_string(root.join("esp/EFI/MX/stub/initrd.img"))?,
            "initrd.img-6.1.0-37-amd64"
        );
        Ok(())
    }
}
