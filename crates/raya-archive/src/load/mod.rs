//! Load side of the heap archive
//!
//! Two loaders share one archive format:
//!
//! - **Mapped** ([`load_mapped`]): the image is mapped at an address range
//!   granted by the host and patched in place
//! - **Loaded** ([`load_loaded`]): every object is copied into memory from
//!   the collector's allocator and references are rewritten through the
//!   stream slots
//!
//! [`load_archive`] picks a loader from [`LoadOptions`], turns recoverable
//! failures into [`LoadOutcome::Disabled`] and returns fatal ones as errors.
//! [`bootstrap`] additionally publishes the root through an [`ArchiveGate`].

mod loaded;
mod mapped;
pub mod verify;

pub use loaded::{load_loaded, Block, LoadSession, LoadedArchive};
pub use mapped::{load_mapped, quick_path_constant, MappedArchive, MappedHeap};
pub use verify::{verify_loaded_heap, VerifyReport};

use crate::archive::{FormatError, HeapArchive};
use crate::codec::ReferenceEncoding;
use crate::heap::{DestinationAllocator, MappedRegionHost};
use crate::object::Address;
use crate::{ArchiveError, ArchiveResult, ErrorClass};
use log::{info, warn};
use once_cell::sync::OnceCell;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Environment variable overriding [`LoadOptions::mode`]
pub const ENV_MODE: &str = "RAYA_ARCHIVE_MODE";

/// Environment variable overriding [`LoadOptions::verify_after_load`]
pub const ENV_VERIFY: &str = "RAYA_ARCHIVE_VERIFY";

/// Environment variable overriding [`LoadOptions::verify_checksum`]
pub const ENV_CHECKSUM: &str = "RAYA_ARCHIVE_CHECKSUM";

/// Counts gathered while relocating
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocationStats {
    /// Non-null references rewritten
    pub references: usize,
    /// Null references skipped
    pub null_references: usize,
    /// Native pointers rebased
    pub native_pointers: usize,
}

/// Loader selection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Map the image and patch it in place
    Mapped,
    /// Copy every object into allocator memory
    Loaded,
    /// Try Mapped, fall back to Loaded
    #[default]
    Auto,
}

impl FromStr for LoadMode {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mapped" => Ok(LoadMode::Mapped),
            "loaded" => Ok(LoadMode::Loaded),
            "auto" => Ok(LoadMode::Auto),
            other => Err(ArchiveError::InvalidOptions(format!(
                "unknown load mode '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Mapped => write!(f, "mapped"),
            LoadMode::Loaded => write!(f, "loaded"),
            LoadMode::Auto => write!(f, "auto"),
        }
    }
}

/// Load configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Loader selection
    pub mode: LoadMode,

    /// Runtime reference encoding; `None` reuses the archive's encoding
    pub runtime_encoding: Option<ReferenceEncoding>,

    /// Actual base of the native image; `None` means it sits at the
    /// requested base
    pub native_base: Option<u64>,

    /// Check every loaded reference points at a loaded object
    pub verify_after_load: bool,

    /// Check the file checksum before loading
    pub verify_checksum: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            mode: LoadMode::Auto,
            runtime_encoding: None,
            native_base: None,
            verify_after_load: false,
            verify_checksum: true,
        }
    }
}

impl LoadOptions {
    /// Default options with environment overrides applied
    pub fn from_env() -> ArchiveResult<Self> {
        let mut options = Self::default();
        if let Ok(mode) = std::env::var(ENV_MODE) {
            options.mode = mode.parse()?;
        }
        if let Ok(value) = std::env::var(ENV_VERIFY) {
            options.verify_after_load = parse_flag(ENV_VERIFY, &value)?;
        }
        if let Ok(value) = std::env::var(ENV_CHECKSUM) {
            options.verify_checksum = parse_flag(ENV_CHECKSUM, &value)?;
        }
        Ok(options)
    }

    /// Set the loader selection
    pub fn with_mode(mut self, mode: LoadMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the runtime reference encoding
    pub fn with_runtime_encoding(mut self, encoding: ReferenceEncoding) -> Self {
        self.runtime_encoding = Some(encoding);
        self
    }

    /// Set the actual native image base
    pub fn with_native_base(mut self, base: u64) -> Self {
        self.native_base = Some(base);
        self
    }

    /// Enable or disable post-load verification
    pub fn with_verify_after_load(mut self, verify: bool) -> Self {
        self.verify_after_load = verify;
        self
    }

    /// Enable or disable checksum verification
    pub fn with_verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }
}

fn parse_flag(name: &str, value: &str) -> ArchiveResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ArchiveError::InvalidOptions(format!(
            "{}: expected a boolean, got '{}'",
            name, value
        ))),
    }
}

/// Where an archive comes from
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    /// Archive file, mapped copy-on-write
    File(PathBuf),
    /// Archive bytes already in memory
    Memory(Vec<u8>),
}

impl ArchiveSource {
    /// Parse the archive
    pub fn open(&self, verify_checksum: bool) -> Result<HeapArchive, FormatError> {
        match self {
            ArchiveSource::File(path) => HeapArchive::open(path, verify_checksum),
            ArchiveSource::Memory(bytes) => HeapArchive::from_bytes(bytes, verify_checksum),
        }
    }
}

impl From<PathBuf> for ArchiveSource {
    fn from(path: PathBuf) -> Self {
        ArchiveSource::File(path)
    }
}

impl From<Vec<u8>> for ArchiveSource {
    fn from(bytes: Vec<u8>) -> Self {
        ArchiveSource::Memory(bytes)
    }
}

/// Result of [`load_archive`]
#[derive(Debug)]
pub enum LoadOutcome {
    /// Image mapped and patched in place
    Mapped(MappedArchive),
    /// Objects copied into allocator memory
    Loaded(LoadedArchive),
    /// Archive not usable for this run; start without it
    Disabled(String),
}

impl LoadOutcome {
    /// Materialized root array, if the archive was loaded
    pub fn root(&self) -> Option<Address> {
        match self {
            LoadOutcome::Mapped(mapped) => Some(mapped.root),
            LoadOutcome::Loaded(loaded) => Some(loaded.root),
            LoadOutcome::Disabled(_) => None,
        }
    }

    /// Check if the archive was loaded
    pub fn is_available(&self) -> bool {
        !matches!(self, LoadOutcome::Disabled(_))
    }

    /// Loader that produced the outcome
    pub fn mode(&self) -> Option<LoadMode> {
        match self {
            LoadOutcome::Mapped(_) => Some(LoadMode::Mapped),
            LoadOutcome::Loaded(_) => Some(LoadMode::Loaded),
            LoadOutcome::Disabled(_) => None,
        }
    }
}

/// Load an archive with the loader chosen by `options`
///
/// Recoverable failures (bad file, incompatible encoding, unavailable
/// mapping) produce [`LoadOutcome::Disabled`]. Everything else is returned as
/// an error and must abort start-up.
pub fn load_archive<H>(
    source: &ArchiveSource,
    heap: &mut H,
    options: &LoadOptions,
) -> ArchiveResult<LoadOutcome>
where
    H: DestinationAllocator + MappedRegionHost,
{
    match try_load(source, heap, options) {
        Ok(outcome) => Ok(outcome),
        Err(err) if err.class() == ErrorClass::Recoverable => {
            warn!("Heap archive disabled: {}", err);
            Ok(LoadOutcome::Disabled(err.to_string()))
        }
        Err(err) => Err(err),
    }
}

fn try_load<H>(
    source: &ArchiveSource,
    heap: &mut H,
    options: &LoadOptions,
) -> ArchiveResult<LoadOutcome>
where
    H: DestinationAllocator + MappedRegionHost,
{
    let archive = source.open(options.verify_checksum)?;
    let runtime = options
        .runtime_encoding
        .unwrap_or_else(|| archive.encoding());
    let native_delta = match options.native_base {
        Some(base) => base.wrapping_sub(archive.header().native_base) as i64,
        None => 0,
    };

    let outcome = match options.mode {
        LoadMode::Mapped => {
            LoadOutcome::Mapped(load_mapped(archive, heap, runtime, native_delta)?)
        }
        LoadMode::Loaded => {
            LoadOutcome::Loaded(load_loaded(archive, heap, runtime, native_delta)?)
        }
        LoadMode::Auto => match load_mapped(archive, heap, runtime, native_delta) {
            Ok(mapped) => LoadOutcome::Mapped(mapped),
            Err(err) if err.class() == ErrorClass::Recoverable => {
                info!("Mapped load unavailable ({}), copying objects instead", err);
                let archive = source.open(options.verify_checksum)?;
                LoadOutcome::Loaded(load_loaded(archive, heap, runtime, native_delta)?)
            }
            Err(err) => return Err(err),
        },
    };

    if options.verify_after_load {
        let report = match &outcome {
            LoadOutcome::Mapped(mapped) => verify_loaded_heap(
                &mapped.heap,
                &mapped.types,
                mapped.encoding,
                &mapped.regions,
            )?,
            LoadOutcome::Loaded(loaded) => {
                verify_loaded_heap(&*heap, &loaded.types, loaded.encoding, &loaded.regions())?
            }
            LoadOutcome::Disabled(_) => VerifyReport::default(),
        };
        info!(
            "Verified {} objects and {} references",
            report.objects, report.references
        );
    }
    Ok(outcome)
}

/// Load an archive and publish its root through `gate`
///
/// The gate is published only when the archive was loaded.
pub fn bootstrap<H>(
    source: &ArchiveSource,
    heap: &mut H,
    options: &LoadOptions,
    gate: &ArchiveGate,
) -> ArchiveResult<LoadOutcome>
where
    H: DestinationAllocator + MappedRegionHost,
{
    let outcome = load_archive(source, heap, options)?;
    if let Some(root) = outcome.root() {
        gate.publish(root);
    }
    Ok(outcome)
}

/// Process-wide readiness flag for the archived heap
///
/// Set once after loading completes; never cleared.
#[derive(Debug)]
pub struct ArchiveGate {
    ready: AtomicBool,
    root: OnceCell<Address>,
}

impl ArchiveGate {
    /// Unpublished gate
    pub const fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            root: OnceCell::new(),
        }
    }

    /// Publish the materialized root; later calls are ignored
    pub fn publish(&self, root: Address) -> bool {
        if self.root.set(root).is_err() {
            return false;
        }
        self.ready.store(true, Ordering::Release);
        true
    }

    /// Check if the archived heap is fully available
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Published root, once ready
    pub fn root(&self) -> Option<Address> {
        if self.is_ready() {
            self.root.get().copied()
        } else {
            None
        }
    }
}

impl Default for ArchiveGate {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_GATE: ArchiveGate = ArchiveGate::new();

/// The process-wide gate
pub fn global_gate() -> &'static ArchiveGate {
    &GLOBAL_GATE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_load_mode_parse() {
        assert_eq!("mapped".parse::<LoadMode>().unwrap(), LoadMode::Mapped);
        assert_eq!("Loaded".parse::<LoadMode>().unwrap(), LoadMode::Loaded);
        assert_eq!("auto".parse::<LoadMode>().unwrap(), LoadMode::Auto);
        assert!("eager".parse::<LoadMode>().is_err());
        assert_eq!(LoadMode::Mapped.to_string(), "mapped");
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("X", "1").unwrap());
        assert!(parse_flag("X", "TRUE").unwrap());
        assert!(!parse_flag("X", "off").unwrap());
        assert!(parse_flag("X", "maybe").is_err());
    }

    #[test]
    fn test_default_options() {
        let options = LoadOptions::default();
        assert_eq!(options.mode, LoadMode::Auto);
        assert!(options.verify_checksum);
        assert!(!options.verify_after_load);
        assert_eq!(options.runtime_encoding, None);
    }

    #[test]
    fn test_gate_publishes_once() {
        let gate = ArchiveGate::new();
        assert!(!gate.is_ready());
        assert_eq!(gate.root(), None);

        assert!(gate.publish(Address::new(0x1000)));
        assert!(!gate.publish(Address::new(0x2000)));
        assert!(gate.is_ready());
        assert_eq!(gate.root(), Some(Address::new(0x1000)));
    }

    #[test]
    fn test_gate_visible_across_threads() {
        let gate = Arc::new(ArchiveGate::new());
        let reader = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || loop {
                if let Some(root) = gate.root() {
                    return root;
                }
                thread::yield_now();
            })
        };
        gate.publish(Address::new(0x4000));
        assert_eq!(reader.join().unwrap(), Address::new(0x4000));
    }

    #[test]
    fn test_unreadable_source_is_disabled() {
        let mut heap = crate::heap::ArenaHeap::new();
        let source = ArchiveSource::Memory(vec![0u8; 16]);
        let outcome = load_archive(&source, &mut heap, &LoadOptions::default()).unwrap();
        assert!(matches!(outcome, LoadOutcome::Disabled(_)));
        assert_eq!(outcome.root(), None);
    }
}
